use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid project url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("project url must use http or https, got '{0}'")]
    UnsupportedScheme(String),
}

/// Base URL and public key of one hosted project, plus the URL layout of
/// its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEndpoint {
    base_url: Url,
    anon_key: String,
}

impl ProjectEndpoint {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, EndpointError> {
        let mut parsed = Url::parse(base_url.trim()).map_err(|err| EndpointError::InvalidUrl {
            url: base_url.to_owned(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EndpointError::UnsupportedScheme(parsed.scheme().to_owned()));
        }
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        parsed.set_query(None);
        parsed.set_fragment(None);

        Ok(Self {
            base_url: parsed,
            anon_key: anon_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Whether `url` targets this project, so it may carry project credentials.
    pub fn owns(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    pub fn rest(&self, relation: &str) -> Url {
        self.join(&format!("rest/v1/{}", relation.trim_start_matches('/')))
    }

    pub fn rpc(&self, function: &str) -> Url {
        self.join(&format!("rest/v1/rpc/{function}"))
    }

    pub fn function(&self, name: &str) -> Url {
        self.join(&format!("functions/v1/{name}"))
    }

    pub fn auth(&self, path: &str) -> Url {
        self.join(&format!("auth/v1/{}", path.trim_start_matches('/')))
    }

    /// Websocket URL of the realtime service.
    pub fn realtime(&self) -> Url {
        let mut url = self.join("realtime/v1/websocket");
        let scheme = if self.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        // http(s) -> ws(s) is always an accepted scheme change for the url crate.
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        url
    }

    fn join(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let full = format!("{}{}", self.base_url.path(), path);
        url.set_path(&full);
        url
    }
}
