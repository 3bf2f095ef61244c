//! 定宽整数的字节序编解码。

use super::{AsyncRead, AsyncWrite};
use crate::error::IoError;

macro_rules! binary_codecs {
    ($($ty:ty => ($read_le:ident, $read_be:ident, $write_le:ident, $write_be:ident),)+) => {
        $(
            /// 以小端序读取一个定宽整数。
            pub async fn $read_le<R: AsyncRead + ?Sized>(reader: &mut R) -> Result<$ty, IoError> {
                let mut bytes = [0u8; size_of::<$ty>()];
                reader.read_exactly(&mut bytes).await?;
                Ok(<$ty>::from_le_bytes(bytes))
            }

            /// 以大端序读取一个定宽整数。
            pub async fn $read_be<R: AsyncRead + ?Sized>(reader: &mut R) -> Result<$ty, IoError> {
                let mut bytes = [0u8; size_of::<$ty>()];
                reader.read_exactly(&mut bytes).await?;
                Ok(<$ty>::from_be_bytes(bytes))
            }

            /// 以小端序写出一个定宽整数。
            pub async fn $write_le<W: AsyncWrite + ?Sized>(
                writer: &mut W,
                value: $ty,
            ) -> Result<(), IoError> {
                writer.write_all(&value.to_le_bytes()).await
            }

            /// 以大端序写出一个定宽整数。
            pub async fn $write_be<W: AsyncWrite + ?Sized>(
                writer: &mut W,
                value: $ty,
            ) -> Result<(), IoError> {
                writer.write_all(&value.to_be_bytes()).await
            }
        )+
    };
}

binary_codecs! {
    u16 => (read_u16_le, read_u16_be, write_u16_le, write_u16_be),
    u32 => (read_u32_le, read_u32_be, write_u32_le, write_u32_be),
    u64 => (read_u64_le, read_u64_be, write_u64_le, write_u64_be),
}
