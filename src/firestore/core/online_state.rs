/// Whether the client believes it can reach the backend. Views raised while
/// offline are marked as coming from cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed conclusively yet.
    #[default]
    Unknown,
    Online,
    Offline,
}
