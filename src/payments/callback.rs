use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters the gateway sent back with the payer, split by where they
/// arrived: the query string or a form-encoded body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackRequest {
    query: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl CallbackRequest {
    pub fn new(query: HashMap<String, String>, form: HashMap<String, String>) -> Self {
        Self { query, form }
    }

    pub fn from_query<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            query: collect(pairs),
            form: HashMap::new(),
        }
    }

    pub fn from_form<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            query: HashMap::new(),
            form: collect(pairs),
        }
    }

    /// Query string parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Form body parameter.
    pub fn post(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Body first, then query string.
    pub fn input(&self, name: &str) -> Option<&str> {
        self.post(name).or_else(|| self.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.form.is_empty()
    }
}

fn collect<K, V, I>(pairs: I) -> HashMap<String, String>
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
