use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("shift engine stalled")]
    Stalled,
    #[error("transfer of {0} bits exceeds the shift engine limit")]
    TooLong(u16),
    #[error("buffer too short for a {0} bit transfer")]
    ShortBuffer(u16),
    #[error("could not drive a signal line")]
    Pin,
    #[error("hand-off word {0} does not name the next filled slot")]
    Handoff(u32),
}

pub type Result<T> = core::result::Result<T, Error>;
