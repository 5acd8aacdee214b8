//! Names and sizes the server side of the protocol expects verbatim.

pub const REQUEST_TYPE_PARAMETER: &str = "v-r";
pub const REQUEST_TYPE_UIDL: &str = "uidl";
pub const REQUEST_TYPE_HEARTBEAT: &str = "heartbeat";
pub const REQUEST_TYPE_PUSH: &str = "push";
pub const REQUEST_TYPE_INIT: &str = "init";

pub const UI_ID_PARAMETER: &str = "v-uiId";
pub const PUSH_ID_PARAMETER: &str = "v-pushId";

pub const CSRF_TOKEN: &str = "csrfToken";
/// Placeholder the server hands out before a real token exists; never echoed back.
pub const CSRF_TOKEN_DEFAULT_VALUE: &str = "init";

pub const RPC_INVOCATIONS: &str = "rpc";
pub const SERVER_SYNC_ID: &str = "syncId";
pub const CLIENT_TO_SERVER_ID: &str = "clientId";
pub const RESYNCHRONIZE_ID: &str = "resynchronize";

pub const UIDL_SECURITY_TOKEN_ID: &str = "Vaadin-Security-Key";
pub const UIDL_PUSH_ID: &str = "Vaadin-Push-ID";
pub const UIDL_REFRESH_TOKEN: &str = "Vaadin-Refresh";

pub const KEY_EXECUTE: &str = "execute";
pub const META_SESSION_EXPIRED: &str = "sessionExpired";
pub const META_ASYNC: &str = "async";
pub const META_APP_ERROR: &str = "appError";
pub const INVOCATION_NODE: &str = "node";

pub const JSON_PREFIX: &str = "for(;;);[";
pub const JSON_SUFFIX: &str = "]";

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
pub const HEARTBEAT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

pub const MESSAGE_DELIMITER: char = '|';
pub const WEBSOCKET_BUFFER_SIZE: usize = 16384;
/// Largest push fragment; the server decodes a websocket frame of
/// `WEBSOCKET_BUFFER_SIZE` bytes and a UTF-16 unit may take four of them.
pub const WEBSOCKET_FRAGMENT_SIZE: usize = WEBSOCKET_BUFFER_SIZE / 4 - 1;

pub const TRANSPORT_WEBSOCKET: &str = "websocket";
pub const TRANSPORT_LONG_POLLING: &str = "long-polling";
