use thiserror::Error;

/// エラー型
///
/// The in-process transport never fails; transports that cross a process
/// boundary report delivery problems as [`BroadcastError::Transport`].
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Transport error: {0}")]
    Transport(String),
}
