#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: std::future::Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

#[inline]
pub fn spawn_blocking<O, F>(f: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: FnOnce() -> O + Send + 'static,
{
    tokio::task::spawn_blocking(f)
}

/// Installs a global subscriber that streams spans to Tracy.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        log::warn!("tracing subscriber already installed: {err}");
    }
}
