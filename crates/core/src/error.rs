use thiserror::Error;

/// Engine error taxonomy.
///
/// Data-plane failures (short packets, write failures, inactive-lane drops)
/// never surface here; they are counted and skipped. These variants cover
/// state-machine-affecting control-plane failures and programmer errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `add_subscriber` called on a room that has not become relay.
    #[error("room is not in relay mode")]
    NotRelay,
    /// A subscriber with the same peer id already exists in the room.
    #[error("subscriber {0} already exists")]
    AlreadyExists(String),
    /// The remote SDP was rejected by the WebRTC stack.
    #[error("remote SDP rejected: {0}")]
    SdpRejected(String),
    /// Local answer/offer creation or ICE gathering failed.
    #[error("ICE setup failed: {0}")]
    IceSetupFailed(String),
    /// `create_room` called twice for the same room id.
    #[error("room {0} already exists")]
    RoomExists(String),
    /// Operation addressed a room this engine does not hold.
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    /// The room has been torn down; outstanding operations fail with this.
    #[error("room has been closed")]
    RoomClosed,
    /// Unrecoverable failure inside the media stack.
    #[error("media stack error: {0}")]
    Stack(anyhow::Error),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Stack(err)
    }
}
