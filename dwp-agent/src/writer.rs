// Helper functions for writing DWP data types into buffers

use bytes::BufMut;

/// Write a DWP string (4-byte length prefix + UTF-8 bytes)
pub fn write_string<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn write_bool<B: BufMut>(buf: &mut B, value: bool) {
    buf.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_write_string() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "héllo");
        assert_eq!(&buf[..4], &[0, 0, 0, 6]);
        assert_eq!(&buf[4..], "héllo".as_bytes());
    }
}
