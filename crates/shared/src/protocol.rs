use serde::{Deserialize, Serialize};

use crate::domain::{ClientId, Position};

/// One JSON text frame on the wire, tagged by `type`.
///
/// `newclient` is sent by the server to a freshly connected client only;
/// `to` names the client's own identifier. `move` and `leaved` describe the
/// marker keyed by `to`. `private` carries text addressed to `to` from
/// `from`. `msgHistory` is the body of the HTTP history request rather than
/// a socket frame. `Error` is echoed to a sender whose private message
/// could not be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "newclient")]
    NewClient { to: ClientId, position: Position },
    #[serde(rename = "move")]
    Move { to: ClientId, position: Position },
    #[serde(rename = "leaved")]
    Leaved { to: ClientId },
    #[serde(rename = "private")]
    Private {
        to: ClientId,
        from: ClientId,
        msg: String,
    },
    #[serde(rename = "msgHistory")]
    MsgHistory { to: ClientId, from: ClientId },
    #[serde(rename = "Error")]
    Error { to: ClientId, msg: String },
}

/// One stored private-message row, as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateRecord {
    pub from: ClientId,
    pub msg: String,
}
