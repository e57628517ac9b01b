use bytes::{Buf, BufMut, Bytes};
use bytes_varint::VarIntSupport;

use crate::error::ProtocolError;
use crate::protocol::MAGIC;
use crate::util::u24::U24;

// Reading past the end of a buffer is a protocol error, never a panic or a silent truncation.
//  `bytes::Buf` panics on underflow, so all parsing goes through these checked getters.
macro_rules! checked_getter {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(ProtocolError::malformed(concat!("buffer underflow reading ", stringify!($ty))));
            }
            Ok(self.$getter())
        }
    }
}

pub trait BufExt: Buf {
    checked_getter!(get_u8_checked, u8, get_u8);
    checked_getter!(get_u16_checked, u16, get_u16);
    checked_getter!(get_u16_le_checked, u16, get_u16_le);
    checked_getter!(get_u32_checked, u32, get_u32);
    checked_getter!(get_u64_checked, u64, get_u64);

    fn get_bool_checked(&mut self) -> anyhow::Result<bool> {
        Ok(self.get_u8_checked()? != 0)
    }

    fn get_u24_le_checked(&mut self) -> anyhow::Result<U24> {
        if self.remaining() < 3 {
            return Err(ProtocolError::malformed("buffer underflow reading u24"));
        }
        let raw = self.get_uint_le(3);
        Ok(U24::from_raw(raw as u32))
    }

    fn get_bytes_checked(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            return Err(ProtocolError::malformed(format!("buffer underflow reading {} bytes, {} remaining", len, self.remaining())));
        }
        Ok(self.copy_to_bytes(len))
    }

    /// RakNet style string: u16 BE length, followed by UTF-8 bytes
    fn get_string_checked(&mut self) -> anyhow::Result<String> {
        let len = self.get_u16_checked()? as usize;
        let raw = self.get_bytes_checked(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::malformed("string is not valid UTF-8"))
    }

    fn get_var_u32_checked(&mut self) -> anyhow::Result<u32> {
        (&mut *self).try_get_u32_varint()
            .map_err(|e| ProtocolError::malformed(format!("invalid u32 var-int: {:?}", e)))
    }

    fn get_var_i32_checked(&mut self) -> anyhow::Result<i32> {
        (&mut *self).try_get_i32_varint()
            .map_err(|e| ProtocolError::malformed(format!("invalid i32 var-int: {:?}", e)))
    }

    fn get_var_u64_checked(&mut self) -> anyhow::Result<u64> {
        (&mut *self).try_get_u64_varint()
            .map_err(|e| ProtocolError::malformed(format!("invalid u64 var-int: {:?}", e)))
    }

    fn get_var_i64_checked(&mut self) -> anyhow::Result<i64> {
        (&mut *self).try_get_i64_varint()
            .map_err(|e| ProtocolError::malformed(format!("invalid i64 var-int: {:?}", e)))
    }

    /// Consumes the 16 byte offline message cookie, failing if it does not match exactly
    fn expect_magic(&mut self) -> anyhow::Result<()> {
        if self.remaining() < MAGIC.len() {
            return Err(ProtocolError::BadMagic.into());
        }
        let mut actual = [0u8; 16];
        self.copy_to_slice(&mut actual);
        if actual != MAGIC {
            return Err(ProtocolError::BadMagic.into());
        }
        Ok(())
    }
}

pub trait BufMutExt: BufMut {
    fn put_u24_le(&mut self, value: U24) {
        self.put_uint_le(value.to_raw() as u64, 3);
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(if value { 1 } else { 0 });
    }

    fn put_string(&mut self, s: &str) {
        //NB: longer strings are truncated - there is no RakNet string that comes close
        let len = s.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&s.as_bytes()[..len]);
    }

    fn put_magic(&mut self) {
        self.put_slice(&MAGIC);
    }
}

impl <T: Buf> BufExt for T {}

impl <T: BufMut> BufMutExt for T {}

/// Fails if a decoder left bytes unconsumed - this indicates a codec mismatch rather than
///  something that can be safely ignored
pub fn expect_fully_consumed(buf: &impl Buf, what: &str) -> anyhow::Result<()> {
    if buf.has_remaining() {
        return Err(ProtocolError::malformed(format!("{} trailing bytes after {}", buf.remaining(), what)));
    }
    Ok(())
}
