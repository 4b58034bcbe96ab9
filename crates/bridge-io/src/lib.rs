mod conn;
mod copy;
mod envelope;
mod frame;
mod pinnable;
mod shared;

use tokio::io::{AsyncRead, AsyncWrite};

#[rustfmt::skip]
pub use self::conn::*;
#[rustfmt::skip]
pub use self::copy::*;
#[rustfmt::skip]
pub use self::envelope::*;
#[rustfmt::skip]
pub use self::frame::*;
#[rustfmt::skip]
pub use self::pinnable::*;
#[rustfmt::skip]
pub use self::shared::*;

pub type ErasedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type ErasedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite {}

pub type ErasedReadWrite = Box<dyn AsyncReadWrite + Send + Unpin>;
