use indexmap::IndexMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FormMethod {
    Get,
    Post,
}

impl FormMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormMethod::Get => "GET",
            FormMethod::Post => "POST",
        }
    }
}

impl std::fmt::Display for FormMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Describes how to hand the payer over to the gateway's hosted page.
/// Rendering (HTML auto-submit form, HTTP redirect, JSON for an SPA) is up
/// to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedirectionForm {
    action: String,
    method: FormMethod,
    fields: IndexMap<String, String>,
}

impl RedirectionForm {
    pub fn new(action: impl Into<String>, method: FormMethod) -> Self {
        Self {
            action: action.into(),
            method,
            fields: IndexMap::new(),
        }
    }

    pub fn get(action: impl Into<String>) -> Self {
        Self::new(action, FormMethod::Get)
    }

    pub fn post(action: impl Into<String>) -> Self {
        Self::new(action, FormMethod::Post)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn method(&self) -> FormMethod {
        self.method
    }

    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Full URL for a GET hand-off, with the fields appended as query
    /// parameters. `None` for POST forms or an unparsable action.
    pub fn redirect_url(&self) -> Option<String> {
        if self.method != FormMethod::Get {
            return None;
        }
        let mut url = Url::parse(&self.action).ok()?;
        if !self.fields.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.fields {
                pairs.append_pair(name, value);
            }
        }
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_form_builds_redirect_url() {
        let form = RedirectionForm::get("https://gateway.zibal.ir/start/123")
            .with_field("lang", "fa");
        assert_eq!(
            form.redirect_url().as_deref(),
            Some("https://gateway.zibal.ir/start/123?lang=fa")
        );

        let bare = RedirectionForm::get("https://pay.ir/pg/abc");
        assert_eq!(bare.redirect_url().as_deref(), Some("https://pay.ir/pg/abc"));
    }

    #[test]
    fn post_form_keeps_field_order_and_has_no_redirect_url() {
        let form = RedirectionForm::post("https://sep.shaparak.ir/OnlinePG/OnlinePG")
            .with_field("Token", "t-1")
            .with_field("GetMethod", "");
        assert_eq!(form.method(), FormMethod::Post);
        assert!(form.redirect_url().is_none());
        let names: Vec<&String> = form.fields().keys().collect();
        assert_eq!(names, vec!["Token", "GetMethod"]);
        assert_eq!(serde_json::to_value(form.method()).unwrap(), "POST");
    }
}
