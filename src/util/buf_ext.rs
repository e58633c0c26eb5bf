use anyhow::anyhow;
use bytes::{Buf, BufMut};
use uuid::Uuid;


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Checked little-endian reads for the fixed-layout blocks embedded in packets
pub trait BufExt: Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u32_le, u32, get_u32_le);
    get_checked_impl!(checked_get_i32_le, i32, get_i32_le);

    fn checked_get_uuid(&mut self) -> anyhow::Result<Uuid> {
        if self.remaining() < 16 {
            return Err(anyhow!("buffer underflow"));
        }
        let mut raw = [0u8; 16];
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }
}

impl <T: Buf> BufExt for T {}


pub trait BufMutExt: BufMut {
    fn put_uuid(&mut self, id: &Uuid) {
        self.put_slice(id.as_bytes());
    }
}

impl <T: BufMut> BufMutExt for T {}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_get_underflow() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(buf.checked_get_u32_le().is_err());
        assert_eq!(buf.checked_get_u8().unwrap(), 1);
        assert!(buf.checked_get_uuid().is_err());
    }

    #[test]
    fn test_uuid_keeps_textual_byte_order() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let mut buf = Vec::new();
        buf.put_uuid(&id);
        assert_eq!(buf[15], 1);

        let mut read: &[u8] = &buf;
        assert_eq!(read.checked_get_uuid().unwrap(), id);
    }
}
