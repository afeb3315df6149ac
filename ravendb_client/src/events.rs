/// Things that happen inside a request executor, broadcast to anyone who
/// [subscribed](crate::request_executor::RequestExecutor::subscribe).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestEvent {
    BeforeRequest { url: String },
    FailedRequest { url: String, error: String },
    SucceedRequest { url: String, status: u16 },
    TopologyUpdated { etag: i64 },
}
