use std::{
    collections::BTreeMap,
    io::{Error, ErrorKind, Result},
};

use crate::bencoding::value::Value;

impl Value {
    /// Decodes a single bencoded value. Trailing whitespace is tolerated,
    /// anything else after the value is an error.
    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut parser = Parser::new();
        for byte in input {
            parser.consume(*byte)?;
        }
        parser.result()
    }
}

#[derive(Debug)]
struct Parser {
    state: State,
    stack: Vec<StackState>,
    position: usize,
}

#[derive(Debug)]
enum State {
    Ready,
    Integer(Option<i64>, i64),
    StringLength(usize),
    StringContents(Vec<u8>, usize),
    Done(Value),
}

#[derive(Debug)]
enum StackState {
    List(Vec<Value>),
    Dictionary(Option<String>, BTreeMap<String, Value>),
}

impl StackState {
    fn new_list() -> Self {
        Self::List(Vec::new())
    }

    fn new_dictionary() -> Self {
        Self::Dictionary(None, BTreeMap::new())
    }
}

impl Parser {
    fn new() -> Self {
        Self {
            state: State::Ready,
            stack: Vec::new(),
            position: 0,
        }
    }

    fn consume(&mut self, byte: u8) -> Result<()> {
        match (&mut self.state, byte) {
            // Integer
            (State::Ready, b'i') => {
                self.state = State::Integer(None, 1);
            }
            (State::Integer(None, sign), b'-') if *sign == 1 => {
                *sign = -1;
            }
            (State::Integer(Some(0), _), b'0'..=b'9') => {
                return Err(invalid(self.position, "leading zeros not allowed"));
            }
            (State::Integer(integer, _), b'0'..=b'9') => {
                let digit = (byte - b'0') as i64;
                let next = integer
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit));
                match next {
                    Some(next) => *integer = Some(next),
                    None => return Err(invalid(self.position, "integer overflow")),
                }
            }
            (&mut State::Integer(Some(0), -1), b'e') => {
                return Err(invalid(self.position, "negative zero not allowed"));
            }
            (&mut State::Integer(Some(integer), sign), b'e') => {
                self.emit(Value::Integer(integer * sign))?;
            }

            // List
            (State::Ready, b'l') => {
                self.stack.push(StackState::new_list());
            }

            // Dictionary
            (State::Ready, b'd') => {
                self.stack.push(StackState::new_dictionary());
            }

            // String
            (State::Ready, b'0'..=b'9') => {
                let digit = (byte - b'0') as usize;
                self.state = State::StringLength(digit);
            }
            (State::StringLength(length), b'0'..=b'9') => {
                let digit = (byte - b'0') as usize;
                match length.checked_mul(10).and_then(|value| value.checked_add(digit)) {
                    Some(next) => *length = next,
                    None => return Err(invalid(self.position, "string length overflow")),
                }
            }
            (&mut State::StringLength(0), b':') => {
                self.emit(Value::String(Vec::new()))?;
            }
            (&mut State::StringLength(length), b':') => {
                self.state = State::StringContents(Vec::new(), length);
            }
            (State::StringContents(bytes, length), _) => {
                bytes.push(byte);
                if bytes.len() == *length {
                    let string = std::mem::take(bytes);
                    self.emit(Value::String(string))?;
                }
            }

            // End collection
            (State::Ready, b'e') => match self.stack.pop() {
                Some(StackState::List(list)) => {
                    self.emit(Value::List(list))?;
                }
                Some(StackState::Dictionary(None, entries)) => {
                    self.emit(Value::Dictionary(entries))?;
                }
                Some(StackState::Dictionary(Some(key), _)) => {
                    return Err(invalid(self.position, &format!("missing value for key '{}'", key)));
                }
                None => {
                    return Err(invalid(self.position, "nothing to close"));
                }
            },

            // Ignore trailing whitespace
            (State::Done(_), b'\n' | b'\r' | b' ') => {}

            // Unexpected input
            _ => {
                return Err(invalid(self.position, &format!("unexpected byte: 0x{byte:02x}")));
            }
        }
        self.position += 1;
        Ok(())
    }

    fn emit(&mut self, value: Value) -> Result<()> {
        match (self.stack.last_mut(), value) {
            (Some(StackState::List(list)), value) => {
                list.push(value);
            }
            (Some(StackState::Dictionary(key @ None, _)), Value::String(string)) => {
                let string = String::from_utf8(string)
                    .map_err(|_| invalid(self.position, "dictionary key should be valid utf8"))?;
                *key = Some(string);
            }
            (Some(StackState::Dictionary(None, _)), _) => {
                return Err(invalid(self.position, "only string keys are allowed in dictionaries"));
            }
            (Some(StackState::Dictionary(key @ Some(_), entries)), value) => {
                if let Some(key) = key.take() {
                    entries.insert(key, value);
                }
            }
            (None, value) => {
                self.state = State::Done(value);
                return Ok(());
            }
        }
        self.state = State::Ready;
        Ok(())
    }

    fn result(self) -> Result<Value> {
        match self.state {
            State::Done(value) => Ok(value),
            _ => Err(Error::new(ErrorKind::UnexpectedEof, "incomplete")),
        }
    }
}

fn invalid(position: usize, reason: &str) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("{} at position {}", reason, position),
    )
}
