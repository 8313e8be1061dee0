// Helper functions for reading DWP data types from buffers

use crate::protocol::{AgentError, AgentResult};
use bytes::Buf;

/// Read a DWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> AgentResult<String> {
    if buf.remaining() < 4 {
        return Err(AgentError::Protocol("Not enough data for string length".to_string()));
    }

    let len = buf.get_u32() as usize;

    if buf.remaining() < len {
        return Err(AgentError::Protocol(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| AgentError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> AgentResult<u32> {
    if buf.remaining() < 4 {
        return Err(AgentError::Protocol("Not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> AgentResult<i32> {
    if buf.remaining() < 4 {
        return Err(AgentError::Protocol("Not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> AgentResult<u8> {
    if buf.remaining() < 1 {
        return Err(AgentError::Protocol("Not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

/// Read a byte as a boolean
pub fn read_bool(buf: &mut &[u8]) -> AgentResult<bool> {
    Ok(read_u8(buf)? != 0)
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> AgentResult<u64> {
    if buf.remaining() < 8 {
        return Err(AgentError::Protocol("Not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Read a i64
pub fn read_i64(buf: &mut &[u8]) -> AgentResult<i64> {
    if buf.remaining() < 8 {
        return Err(AgentError::Protocol("Not enough data for i64".to_string()));
    }
    Ok(buf.get_i64())
}

/// Read an int-sized element count, rejecting negative values
pub fn read_count(buf: &mut &[u8]) -> AgentResult<usize> {
    let n = read_i32(buf)?;
    if n < 0 {
        return Err(AgentError::Protocol(format!("Negative count: {}", n)));
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_string() {
        let data = [0u8, 0, 0, 3, b'a', b'b', b'c', 9];
        let mut buf = &data[..];
        assert_eq!(read_string(&mut buf).unwrap(), "abc");
        assert_eq!(buf, &[9]);
    }

    #[test]
    fn test_short_reads_fail() {
        let mut buf = &[0u8, 0, 0, 9, b'x'][..];
        assert!(read_string(&mut buf).is_err());

        let mut buf = &[1u8, 2][..];
        assert!(read_i32(&mut buf).is_err());

        let mut buf = &[0xffu8, 0xff, 0xff, 0xff][..];
        assert!(read_count(&mut buf).is_err());
    }
}
