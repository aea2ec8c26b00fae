//! Endpoint templates and URL construction.
//!
//! A template is a path, optionally with a query string, holding exactly one
//! placeholder kind: `{{id}}` for one identifier per request or `{{ids_list}}`
//! for a comma-joined batch. Which one it holds decides the [`FetchMode`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use urlencoding::encode;

use crate::errors::UpstreamError;
use crate::models::{Credential, CredentialKind};

pub const ID_PLACEHOLDER: &str = "{{id}}";
pub const IDS_LIST_PLACEHOLDER: &str = "{{ids_list}}";

/// Query parameter that selects the data granularity.
const INTERVAL_PARAM: &str = "interval";

fn default_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_pro_base_url() -> String {
    "https://pro-api.coingecko.com/api/v3".to_string()
}

fn default_paid_key_param() -> String {
    "x_cg_pro_api_key".to_string()
}

fn default_demo_key_param() -> String {
    "x_cg_demo_api_key".to_string()
}

/// Whether an endpoint takes one identifier or a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Single,
    Batch,
}

impl FetchMode {
    fn placeholder(self) -> &'static str {
        match self {
            Self::Single => ID_PLACEHOLDER,
            Self::Batch => IDS_LIST_PLACEHOLDER,
        }
    }
}

/// Where and how to call one upstream endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Path template, e.g. `/simple/price?ids={{ids_list}}`.
    pub path: String,
    /// Host used for demo and anonymous requests.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Host used for paid requests.
    #[serde(default = "default_pro_base_url")]
    pub pro_base_url: String,
    /// Static parameters added to every request. Override same-named
    /// parameters already in the template.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default = "default_paid_key_param")]
    pub paid_key_param: String,
    #[serde(default = "default_demo_key_param")]
    pub demo_key_param: String,
    /// Expected mode. When set, a template that disagrees is rejected.
    #[serde(default)]
    pub mode: Option<FetchMode>,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            base_url: default_base_url(),
            pro_base_url: default_pro_base_url(),
            query_params: BTreeMap::new(),
            paid_key_param: default_paid_key_param(),
            demo_key_param: default_demo_key_param(),
            mode: None,
        }
    }

    /// Use one host for every credential kind.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.pro_base_url = base_url.clone();
        self.base_url = base_url;
        self
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }
}

/// A validated path template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointTemplate {
    raw: String,
    mode: FetchMode,
}

impl EndpointTemplate {
    /// Validate `raw` and work out its mode.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::InvalidTemplate`] when the template holds neither or
    /// both placeholder kinds, or disagrees with `expected`.
    pub fn parse(raw: &str, expected: Option<FetchMode>) -> Result<Self, UpstreamError> {
        let invalid = |message: String| UpstreamError::InvalidTemplate {
            template: raw.to_string(),
            message,
        };

        let has_single = raw.contains(ID_PLACEHOLDER);
        let has_batch = raw.contains(IDS_LIST_PLACEHOLDER);

        let mode = match (has_single, has_batch) {
            (true, false) => FetchMode::Single,
            (false, true) => FetchMode::Batch,
            (true, true) => {
                return Err(invalid(format!(
                    "must contain exactly one of {} or {}, found both",
                    ID_PLACEHOLDER, IDS_LIST_PLACEHOLDER
                )))
            }
            (false, false) => {
                return Err(invalid(format!(
                    "must contain {} or {}",
                    ID_PLACEHOLDER, IDS_LIST_PLACEHOLDER
                )))
            }
        };

        if let Some(expected) = expected {
            if expected != mode {
                return Err(invalid(format!(
                    "{:?} mode requires {}",
                    expected,
                    expected.placeholder()
                )));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            mode,
        })
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Builds request URLs for one endpoint.
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    template: EndpointTemplate,
    config: EndpointConfig,
}

impl RequestBuilder {
    pub fn new(config: &EndpointConfig) -> Result<Self, UpstreamError> {
        let template = EndpointTemplate::parse(&config.path, config.mode)?;
        Ok(Self {
            template,
            config: config.clone(),
        })
    }

    pub fn mode(&self) -> FetchMode {
        self.template.mode()
    }

    /// URL for a single identifier. Fails on a batch template.
    pub fn build_single_url(
        &self,
        id: &str,
        credential: Option<&Credential>,
    ) -> Result<String, UpstreamError> {
        self.require(FetchMode::Single)?;
        Ok(self.render(&encode(id), credential))
    }

    /// URL for a batch of identifiers, joined with commas. Fails on a single
    /// template.
    pub fn build_batch_url(
        &self,
        ids: &[String],
        credential: Option<&Credential>,
    ) -> Result<String, UpstreamError> {
        self.require(FetchMode::Batch)?;
        let joined = ids
            .iter()
            .map(|id| encode(id).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        Ok(self.render(&joined, credential))
    }

    /// URL for `ids` in whatever mode the template is in. Single mode takes
    /// exactly one identifier.
    pub fn build_url(
        &self,
        ids: &[String],
        credential: Option<&Credential>,
    ) -> Result<String, UpstreamError> {
        match self.mode() {
            FetchMode::Batch => self.build_batch_url(ids, credential),
            FetchMode::Single => match ids {
                [id] => self.build_single_url(id, credential),
                _ => Err(UpstreamError::InvalidTemplate {
                    template: self.template.as_str().to_string(),
                    message: format!("single mode takes one id per request, got {}", ids.len()),
                }),
            },
        }
    }

    /// True when the request asks for a sub-daily `interval`.
    pub fn requests_fine_interval(&self) -> bool {
        let from_params = self.config.query_params.get(INTERVAL_PARAM).cloned();
        let from_template = self
            .template
            .as_str()
            .split_once('?')
            .and_then(|(_, query)| {
                parse_query(query)
                    .into_iter()
                    .find(|(k, _)| k == INTERVAL_PARAM)
                    .map(|(_, v)| v)
            });

        match from_params.or(from_template) {
            Some(interval) => !interval.is_empty() && !interval.eq_ignore_ascii_case("daily"),
            None => false,
        }
    }

    fn require(&self, mode: FetchMode) -> Result<(), UpstreamError> {
        if self.mode() == mode {
            Ok(())
        } else {
            Err(UpstreamError::InvalidTemplate {
                template: self.template.as_str().to_string(),
                message: format!("template lacks {}", mode.placeholder()),
            })
        }
    }

    fn base_url_for(&self, credential: Option<&Credential>) -> &str {
        match credential.map(|c| c.kind) {
            Some(CredentialKind::Paid) => &self.config.pro_base_url,
            _ => &self.config.base_url,
        }
    }

    fn key_param_for(&self, credential: &Credential) -> Option<&str> {
        match credential.kind {
            CredentialKind::Paid => Some(&self.config.paid_key_param),
            CredentialKind::Demo => Some(&self.config.demo_key_param),
            CredentialKind::Anonymous => None,
        }
    }

    fn render(&self, substitution: &str, credential: Option<&Credential>) -> String {
        let rendered = self
            .template
            .as_str()
            .replace(self.mode().placeholder(), substitution);
        let (path, query) = match rendered.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rendered.as_str(), None),
        };

        let mut pairs = query.map(parse_query).unwrap_or_default();
        for (key, value) in &self.config.query_params {
            let key = encode(key).into_owned();
            let value = encode(value).into_owned();
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => pairs.push((key, value)),
            }
        }
        if let Some(credential) = credential {
            if let Some(param) = self.key_param_for(credential) {
                pairs.push((encode(param).into_owned(), encode(&credential.secret).into_owned()));
            }
        }

        let mut url = join_url(self.base_url_for(credential), path);
        if !pairs.is_empty() {
            let query = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn batch_config() -> EndpointConfig {
        EndpointConfig::new("/simple/price?ids={{ids_list}}")
            .with_base_url("https://api.example.com/v3/")
            .with_query_param("vs_currencies", "usd")
    }

    #[test]
    fn test_template_modes() {
        assert_eq!(
            EndpointTemplate::parse("/coins/{{id}}", None).unwrap().mode(),
            FetchMode::Single
        );
        assert_eq!(
            EndpointTemplate::parse("/coins/markets?ids={{ids_list}}", None)
                .unwrap()
                .mode(),
            FetchMode::Batch
        );
    }

    #[test]
    fn test_template_rejects_both_or_neither() {
        let both = EndpointTemplate::parse("/coins/{{id}}?ids={{ids_list}}", None);
        assert!(matches!(both, Err(UpstreamError::InvalidTemplate { .. })));

        let neither = EndpointTemplate::parse("/coins/list", None);
        assert!(matches!(neither, Err(UpstreamError::InvalidTemplate { .. })));
    }

    #[test]
    fn test_template_rejects_mode_mismatch() {
        let result = EndpointTemplate::parse("/coins/{{id}}", Some(FetchMode::Batch));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("{{ids_list}}"));
    }

    #[test]
    fn test_batch_url_joins_ids_with_commas() {
        let builder = RequestBuilder::new(&batch_config()).unwrap();
        let url = builder
            .build_batch_url(&ids(&["bitcoin", "ethereum"]), None)
            .unwrap();
        assert_eq!(
            url,
            "https://api.example.com/v3/simple/price?ids=bitcoin,ethereum&vs_currencies=usd"
        );
    }

    #[test]
    fn test_single_url_with_demo_key() {
        let config = EndpointConfig::new("coins/{{id}}").with_base_url("https://api.example.com");
        let builder = RequestBuilder::new(&config).unwrap();
        let url = builder
            .build_single_url("bitcoin", Some(&Credential::demo("demo-1")))
            .unwrap();
        assert_eq!(url, "https://api.example.com/coins/bitcoin?x_cg_demo_api_key=demo-1");
    }

    #[test]
    fn test_paid_key_uses_pro_host() {
        let mut config = batch_config();
        config.pro_base_url = "https://pro.example.com/v3".to_string();
        let builder = RequestBuilder::new(&config).unwrap();

        let url = builder
            .build_batch_url(&ids(&["bitcoin"]), Some(&Credential::paid("paid-1")))
            .unwrap();
        assert!(url.starts_with("https://pro.example.com/v3/simple/price?"));
        assert!(url.ends_with("&x_cg_pro_api_key=paid-1"));
    }

    #[test]
    fn test_anonymous_adds_no_key() {
        let builder = RequestBuilder::new(&batch_config()).unwrap();
        let url = builder
            .build_batch_url(&ids(&["bitcoin"]), Some(&Credential::anonymous()))
            .unwrap();
        assert!(!url.contains("api_key"));
    }

    #[test]
    fn test_static_params_override_template_params() {
        let config = EndpointConfig::new("/coins/markets?ids={{ids_list}}&vs_currency=eur")
            .with_base_url("https://api.example.com")
            .with_query_param("vs_currency", "usd");
        let builder = RequestBuilder::new(&config).unwrap();
        let url = builder.build_batch_url(&ids(&["bitcoin"]), None).unwrap();
        assert_eq!(url, "https://api.example.com/coins/markets?ids=bitcoin&vs_currency=usd");
    }

    #[test]
    fn test_ids_are_percent_encoded() {
        let builder = RequestBuilder::new(&batch_config()).unwrap();
        let url = builder
            .build_batch_url(&ids(&["a&b", "c d"]), None)
            .unwrap();
        assert!(url.contains("ids=a%26b,c%20d&"));
    }

    #[test]
    fn test_wrong_builder_for_mode() {
        let builder = RequestBuilder::new(&batch_config()).unwrap();
        assert!(builder.build_single_url("bitcoin", None).is_err());

        let single = RequestBuilder::new(&EndpointConfig::new("/coins/{{id}}")).unwrap();
        assert!(single.build_batch_url(&ids(&["bitcoin"]), None).is_err());
        assert!(single.build_url(&ids(&["a", "b"]), None).is_err());
        assert!(single.build_url(&ids(&["a"]), None).is_ok());
    }

    #[test]
    fn test_join_url_slashes() {
        assert_eq!(join_url("https://h/v3/", "/coins"), "https://h/v3/coins");
        assert_eq!(join_url("https://h/v3", "coins"), "https://h/v3/coins");
        assert_eq!(join_url("https://h/v3//", "//coins"), "https://h/v3/coins");
    }

    #[test]
    fn test_fine_interval_detection() {
        let daily = EndpointConfig::new("/coins/{{id}}/market_chart?interval=daily");
        assert!(!RequestBuilder::new(&daily).unwrap().requests_fine_interval());

        let hourly = EndpointConfig::new("/coins/{{id}}/market_chart")
            .with_query_param("interval", "hourly");
        assert!(RequestBuilder::new(&hourly).unwrap().requests_fine_interval());

        let none = EndpointConfig::new("/coins/{{id}}");
        assert!(!RequestBuilder::new(&none).unwrap().requests_fine_interval());
    }
}
