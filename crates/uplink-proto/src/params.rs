use url::Url;

use crate::constants::{
    PUSH_ID_PARAMETER, REQUEST_TYPE_HEARTBEAT, REQUEST_TYPE_INIT, REQUEST_TYPE_PARAMETER,
    REQUEST_TYPE_PUSH, REQUEST_TYPE_UIDL, UI_ID_PARAMETER,
};
use crate::ProtoError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Uidl,
    Heartbeat,
    Push,
    Init,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Uidl => REQUEST_TYPE_UIDL,
            RequestType::Heartbeat => REQUEST_TYPE_HEARTBEAT,
            RequestType::Push => REQUEST_TYPE_PUSH,
            RequestType::Init => REQUEST_TYPE_INIT,
        }
    }
}

/// Builds a service URL carrying the request type, the UI id and, for push
/// connections, the push id once the server has assigned one. Existing query
/// parameters on the service URL are kept.
pub fn service_url(
    base: &str,
    request_type: RequestType,
    ui_id: Option<u32>,
    push_id: Option<&str>,
) -> Result<Url, ProtoError> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(REQUEST_TYPE_PARAMETER, request_type.as_str());
        if let Some(ui_id) = ui_id {
            query.append_pair(UI_ID_PARAMETER, &ui_id.to_string());
        }
        if let Some(push_id) = push_id {
            query.append_pair(PUSH_ID_PARAMETER, push_id);
        }
    }
    Ok(url)
}

/// Rewrites an http(s) URL to the matching ws(s) scheme.
pub fn to_websocket(url: &Url) -> Url {
    let mut ws = url.clone();
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return ws,
    };
    // http -> ws keeps the URL special, so set_scheme cannot fail here.
    let _ = ws.set_scheme(scheme);
    ws
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uidl_url_has_type_and_ui() {
        let url = service_url("http://localhost:8080/app/", RequestType::Uidl, Some(3), None)
            .expect("url");
        assert_eq!(url.as_str(), "http://localhost:8080/app/?v-r=uidl&v-uiId=3");
    }

    #[test]
    fn push_url_appends_push_id_after_existing_query() {
        let url = service_url(
            "https://example.com/?lang=en",
            RequestType::Push,
            Some(0),
            Some("a b"),
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "https://example.com/?lang=en&v-r=push&v-uiId=0&v-pushId=a+b"
        );
        assert_eq!(
            to_websocket(&url).as_str(),
            "wss://example.com/?lang=en&v-r=push&v-uiId=0&v-pushId=a+b"
        );
    }

    #[test]
    fn invalid_base_is_an_error() {
        assert!(service_url("not a url", RequestType::Heartbeat, None, None).is_err());
    }
}
