use url::Url;

const AUTH_PARAM: &str = "auth";
const AUTH_SUCCESS: &str = "success";
const TOKEN_PARAM: &str = "token";
const PROVIDER_PARAM: &str = "provider";

/// Parameters left on the URL by a completed third-party sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCallback {
    /// Access credential handed over by the provider flow, if any.
    pub token: Option<String>,
    pub provider: Option<String>,
}

impl ProviderCallback {
    /// Detect a successful callback on `url`.
    ///
    /// Returns the callback together with `url` stripped of the callback
    /// parameters; unrelated parameters are kept in order.
    pub fn take(url: &Url) -> Option<(Self, Url)> {
        let succeeded = url
            .query_pairs()
            .any(|(key, value)| key == AUTH_PARAM && value == AUTH_SUCCESS);
        if !succeeded {
            return None;
        }

        let mut callback = Self {
            token: None,
            provider: None,
        };
        let mut kept = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                AUTH_PARAM => {}
                TOKEN_PARAM => callback.token = Some(value.into_owned()).filter(|t| !t.is_empty()),
                PROVIDER_PARAM => {
                    callback.provider = Some(value.into_owned()).filter(|p| !p.is_empty())
                }
                _ => kept.push((key.into_owned(), value.into_owned())),
            }
        }

        let mut cleaned = url.clone();
        if kept.is_empty() {
            cleaned.set_query(None);
        } else {
            cleaned.query_pairs_mut().clear().extend_pairs(kept);
        }
        Some((callback, cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_strips_callback_params() {
        let raw = "https://chat.example.com/chats?auth=success&token=abc&provider=google&tab=2";
        let url = Url::parse(raw).unwrap();
        let (callback, cleaned) = ProviderCallback::take(&url).unwrap();

        assert_eq!(callback.token.as_deref(), Some("abc"));
        assert_eq!(callback.provider.as_deref(), Some("google"));
        assert_eq!(cleaned.as_str(), "https://chat.example.com/chats?tab=2");
    }

    #[test]
    fn test_take_removes_empty_query() {
        let url = Url::parse("https://chat.example.com/?auth=success&provider=github").unwrap();
        let (callback, cleaned) = ProviderCallback::take(&url).unwrap();

        assert_eq!(callback.token, None);
        assert_eq!(cleaned.as_str(), "https://chat.example.com/");
    }

    #[test]
    fn test_ignores_urls_without_success_marker() {
        for raw in [
            "https://chat.example.com/chats",
            "https://chat.example.com/?auth=failed&token=abc",
            "https://chat.example.com/?token=abc",
        ] {
            assert_eq!(ProviderCallback::take(&Url::parse(raw).unwrap()), None);
        }
    }
}
