use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid data")]
    InvalidData,
    #[error("unknown control command {0:?}")]
    UnknownCommand([u8; 2]),
}
