//! Endpoint URL normalization and assembly (spec §4.1, §6).

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, Secret};
use url::Url;

use crate::error::Error;
use crate::transport::upgrade_scheme;

/// A thunk re-evaluated on every `connect()`, matching spec §9's "accept
/// either a fixed map or a pure thunk" guidance. Implementers must make this
/// safe to call concurrently with the driver's own reads (spec §5).
pub type ParamsProvider = Arc<dyn Fn() -> BTreeMap<String, String> + Send + Sync>;

/// Wraps a fixed `BTreeMap` as a [`ParamsProvider`].
pub fn static_params(params: BTreeMap<String, String>) -> ParamsProvider {
    Arc::new(move || params.clone())
}

/// A normalized Phoenix socket endpoint: scheme, host, and a path already
/// suffixed with `/websocket`. Query parameters (`vsn` and whatever the
/// [`ParamsProvider`] yields) are appended fresh on every connect.
///
/// Endpoints may embed credentials in their query string, so the inner URL
/// is wrapped in [`Secret`] the same way the teacher's `LoginUrl` is.
#[derive(Clone)]
pub struct Endpoint(Secret<Url>);

impl Endpoint {
    /// Parses and normalizes `raw`. An unparseable URL is a fatal
    /// configuration error (spec §4.1).
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut url = Url::parse(raw).map_err(|_| Error::MalformedUrl)?;

        upgrade_scheme(&mut url);
        ensure_websocket_suffix(&mut url);
        url.set_query(None);

        Ok(Self(Secret::new(url)))
    }

    /// Builds the URL to connect to right now: the normalized base plus
    /// `vsn` and the current dynamic params.
    pub fn build(&self, vsn: &str, params: &BTreeMap<String, String>) -> Url {
        let mut url = self.0.expose_secret().clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.append_pair("vsn", vsn);
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        url
    }

    pub fn host(&self) -> String {
        self.0
            .expose_secret()
            .host_str()
            .unwrap_or("<unknown>")
            .to_owned()
    }
}

fn ensure_websocket_suffix(url: &mut Url) {
    let path = url.path();
    if path.ends_with("/websocket") {
        return;
    }

    let mut new_path = path.to_owned();
    if !new_path.ends_with('/') {
        new_path.push('/');
    }
    new_path.push_str("websocket");
    url.set_path(&new_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_websocket_once() {
        let endpoint = Endpoint::parse("http://example.com").unwrap();
        let url = endpoint.build("2.0.0", &BTreeMap::new());
        assert_eq!(url.as_str(), "ws://example.com/websocket?vsn=2.0.0");
    }

    #[test]
    fn does_not_double_suffix_existing_path() {
        let endpoint = Endpoint::parse("https://example.com/socket/websocket").unwrap();
        let url = endpoint.build("2.0.0", &BTreeMap::new());
        assert_eq!(
            url.as_str(),
            "wss://example.com/socket/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn merges_dynamic_params_url_encoded() {
        let endpoint = Endpoint::parse("ws://example.com").unwrap();
        let mut params = BTreeMap::new();
        params.insert("token".to_owned(), "a b".to_owned());

        let url = endpoint.build("2.0.0", &params);
        assert_eq!(
            url.as_str(),
            "ws://example.com/websocket?vsn=2.0.0&token=a+b"
        );
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(matches!(Endpoint::parse("not a url"), Err(Error::MalformedUrl)));
    }
}
