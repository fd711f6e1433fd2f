use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

// column types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Bytes,
    Int64,
}

// a single table cell
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int64(i64),
}

impl Value {
    pub fn vtype(&self) -> ValueType {
        match self {
            Value::Bytes(_) => ValueType::Bytes,
            Value::Int64(_) => ValueType::Int64,
        }
    }
}

// A table row, or a partial row naming just the primary key.
#[derive(Default, Clone, Debug)]
pub struct Record {
    pub(crate) cols: Vec<String>,
    pub(crate) vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn add_bytes(&mut self, col: &str, val: &[u8]) -> &mut Record {
        self.cols.push(col.to_string());
        self.vals.push(Value::Bytes(val.to_vec()));
        self
    }

    pub fn add_int64(&mut self, col: &str, val: i64) -> &mut Record {
        self.cols.push(col.to_string());
        self.vals.push(Value::Int64(val));
        self
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        let idx = self.cols.iter().position(|c| c == col)?;
        Some(&self.vals[idx])
    }
}

// A table definition. The key prefix is auto-assigned on creation and
// keeps the rows of different tables apart in the underlying store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TableDef {
    pub name: String,
    // column types
    pub types: Vec<ValueType>,
    // column names
    pub cols: Vec<String>,
    // the first `pkeys` columns are the primary key
    pub pkeys: usize,
    #[serde(default)]
    pub prefix: u32,
}

// internal table holding metadata such as the next table prefix
pub(crate) fn tdef_meta() -> TableDef {
    TableDef {
        name: "@meta".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        prefix: 1,
    }
}

// internal table holding the table definitions
pub(crate) fn tdef_table() -> TableDef {
    TableDef {
        name: "@table".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["name".to_string(), "def".to_string()],
        pkeys: 1,
        prefix: 2,
    }
}

// Reorder the record columns to the table definition and check for
// missing columns and type mismatches. `n` is either `pkeys` (the record
// is exactly a primary key) or the full column count.
pub(crate) fn check_record(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Value>> {
    ensure!(
        rec.cols.len() >= n,
        "record for {} is missing columns",
        tdef.name
    );
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        ensure!(
            rec.cols[i] == tdef.cols[i],
            "invalid column name: {}",
            rec.cols[i]
        );
        let Some(val) = rec.get(&tdef.cols[i]) else {
            bail!("invalid column name: {}", tdef.cols[i]);
        };
        ensure!(
            val.vtype() == tdef.types[i],
            "invalid column type: {}",
            tdef.cols[i]
        );
        values.push(val.clone());
    }
    Ok(values)
}

// A primary key encodes as | prefix (u32, big-endian) | values |, so the
// byte order of encoded keys follows the row order within a table.
pub(crate) fn encode_key(prefix: u32, vals: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(&mut out, vals);
    out
}

// Encode cells back to back. Byte strings are escaped and
// null-terminated; int64s get their sign bit flipped and go out
// big-endian, which preserves their order under byte comparison.
pub(crate) fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for v in vals {
        match v {
            Value::Bytes(b) => {
                out.extend_from_slice(&escape_bytes(b));
                out.push(0);
            }
            Value::Int64(i) => {
                let u = (*i as u64).wrapping_add(1 << 63);
                out.extend_from_slice(&u.to_be_bytes());
            }
        }
    }
}

pub(crate) fn decode_values(input: &[u8], types: &[ValueType]) -> Result<Vec<Value>> {
    let mut rest = input;
    let mut out = Vec::with_capacity(types.len());
    for t in types {
        match t {
            ValueType::Bytes => {
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                out.push(Value::Bytes(unescape_bytes(&rest[..end])));
                rest = rest.get(end + 1..).unwrap_or_default();
            }
            ValueType::Int64 => {
                ensure!(rest.len() >= 8, "truncated int64 value");
                let u = u64::from_be_bytes(rest[..8].try_into().unwrap());
                out.push(Value::Int64(u.wrapping_sub(1 << 63) as i64));
                rest = &rest[8..];
            }
        }
    }
    Ok(out)
}

// Strings are null-terminated, so the nul byte cannot appear in the
// payload: 0x00 becomes 0x01 0x01 and the escape byte 0x01 becomes
// 0x01 0x02. The transform preserves byte order.
fn escape_bytes(input: &[u8]) -> Vec<u8> {
    if !input.iter().any(|&b| b <= 1) {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(input.len() + 1);
    for &b in input {
        if b <= 1 {
            out.push(0x01);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
    out
}

fn unescape_bytes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == 0x01 && i + 1 < input.len() && (input[i + 1] == 0x01 || input[i + 1] == 0x02) {
            out.push(input[i + 1] - 1);
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}
