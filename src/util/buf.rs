use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("length prefix {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_with_multibyte_chars() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "grüße");
        put_string(&mut buf, "");

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), "grüße");
        assert_eq!(try_get_string(&mut b).unwrap(), "");
        assert!(b.is_empty());
    }

    #[test]
    fn test_truncated_bytes() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"abcdef");
        buf.truncate(4);

        let mut b: &[u8] = &buf;
        assert!(try_get_bytes(&mut b).is_err());
    }
}
