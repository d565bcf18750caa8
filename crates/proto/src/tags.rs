/// Message tags. A request's tag selects its handler; replies and
/// payload frames use the response and work tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    // Task operations.
    Put,
    PutRule,
    Get,
    Iget,

    // Data operations.
    CreateHeader,
    Multicreate,
    Exists,
    StoreHeader,
    StoreSubscript,
    StorePayload,
    Retrieve,
    Enumerate,
    Subscribe,
    RefcountIncr,
    InsertAtomic,
    Unique,
    Typeof,
    ContainerTypeof,
    ContainerReference,
    ContainerSize,
    Lock,
    Unlock,

    // Server-to-server traffic.
    SyncRequest,
    SyncResponse,
    CheckIdle,

    // Control.
    ShutdownWorker,
    ShutdownServer,
    Fail,

    // Outgoing from servers.
    Response,
    ResponsePut,
    ResponseGet,
    ResponseSteal,
    Notification,

    /// Bulk work unit payload, to or from any rank.
    Work,
}

impl Tag {
    /// Whether this tag opens a fresh request at a server, as opposed to
    /// continuing an in-flight exchange.
    pub fn is_request(self) -> bool {
        !matches!(
            self,
            Tag::Response
                | Tag::ResponsePut
                | Tag::ResponseGet
                | Tag::ResponseSteal
                | Tag::SyncResponse
                | Tag::Notification
                | Tag::StoreSubscript
                | Tag::StorePayload
                | Tag::Work
        )
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
