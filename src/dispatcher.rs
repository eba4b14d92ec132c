use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Hands completed inbound payloads to the application: the demo prints them,
///  tests install tracking implementations. Called from stream workers, so
///  implementations must not block for long.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    /// A text message arrived completely on `stream_id`.
    async fn on_text(&self, stream_id: u32, text: &str);

    /// A file download on `stream_id` finished and was flushed to `path`.
    async fn on_file(&self, stream_id: u32, path: &str, fragments: u16);
}
