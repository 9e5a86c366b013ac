use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: u8 = 64;

/// Decodes a single bencode value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut d = Decoder { data, pos: 0 };
    let value = d.value(0)?;
    if d.pos != data.len() {
        return Err(BencodeError::Trailing);
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::Truncated)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn value(&mut self, depth: u8) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthLimit);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            _ => Err(BencodeError::Syntax("unexpected byte")),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump();
        let start = self.pos;
        while self.peek()? != b'e' {
            self.bump();
        }

        let digits = &self.data[start..self.pos];
        self.bump();

        if digits.is_empty() || digits == b"-".as_slice() {
            return Err(BencodeError::Syntax("empty integer"));
        }
        // "i-0e" and leading zeros are invalid per BEP-3.
        if digits.starts_with(b"-0") || (digits[0] == b'0' && digits.len() > 1) {
            return Err(BencodeError::Syntax("leading zero in integer"));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Value::Int)
            .ok_or(BencodeError::Syntax("malformed integer"))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::Syntax("malformed string length"));
            }
            self.bump();
        }

        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::Syntax("malformed string length"))?;
        self.bump();

        if self.data.len() - self.pos < len {
            return Err(BencodeError::Truncated);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: u8) -> Result<Value, BencodeError> {
        self.bump();
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.bump();
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: u8) -> Result<Value, BencodeError> {
        self.bump();
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::Syntax("dictionary key must be a string"));
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.bump();
        Ok(Value::Dict(map))
    }
}
