use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::kv::KV;
use crate::table::{
    check_record, decode_values, encode_key, encode_values, tdef_meta, tdef_table, Record,
    TableDef, Value,
};

// prefixes 1 and 2 belong to the internal catalogs
const TABLE_PREFIX_MIN: u32 = 3;

// how an existing row affects a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    // insert or replace
    Upsert,
    // only replace existing rows
    UpdateOnly,
    // only add new rows
    InsertOnly,
}

// The table layer: a schema catalog over the byte-oriented store. Rows
// are stored one key-value pair each, keyed by the table prefix plus the
// encoded primary key.
pub struct DB {
    kv: KV,
    // cached table definitions
    tables: HashMap<String, TableDef>,
}

impl DB {
    ///
    /// Open a database file, creating it if it does not exist.
    ///
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DB> {
        Ok(DB {
            kv: KV::open(path)?,
            tables: HashMap::new(),
        })
    }

    pub fn close(self) {
        self.kv.close()
    }

    ///
    /// Register a new table and allocate its key prefix.
    ///
    pub fn table_new(&mut self, tdef: &TableDef) -> Result<()> {
        table_def_check(tdef)?;

        // reject a duplicate table
        let mut table = Record::new();
        table.add_bytes("name", tdef.name.as_bytes());
        ensure!(
            !self.db_get(&tdef_table(), &mut table)?,
            "table exists: {}",
            tdef.name
        );

        // allocate the next prefix from the metadata catalog
        let mut prefix = TABLE_PREFIX_MIN;
        let mut meta = Record::new();
        meta.add_bytes("key", b"next_prefix");
        if self.db_get(&tdef_meta(), &mut meta)? {
            let Some(Value::Bytes(raw)) = meta.get("val") else {
                bail!("bad next_prefix entry");
            };
            ensure!(raw.len() == 4, "bad next_prefix entry");
            prefix = u32::from_le_bytes(raw[..4].try_into().unwrap());
            ensure!(prefix >= TABLE_PREFIX_MIN, "bad next_prefix entry");
        }

        let mut next = Record::new();
        next.add_bytes("key", b"next_prefix")
            .add_bytes("val", &(prefix + 1).to_le_bytes());
        self.db_update(&tdef_meta(), next, UpdateMode::Upsert)?;

        // store the definition
        let mut tdef = tdef.clone();
        tdef.prefix = prefix;
        let def = serde_json::to_vec(&tdef).context("encode table definition")?;
        let mut rec = Record::new();
        rec.add_bytes("name", tdef.name.as_bytes())
            .add_bytes("def", &def);
        self.db_update(&tdef_table(), rec, UpdateMode::Upsert)?;

        self.tables.insert(tdef.name.clone(), tdef);
        Ok(())
    }

    // Fetch a single row by primary key. The record names the key
    // columns on the way in and carries the full row on the way out.
    pub fn get(&mut self, table: &str, rec: &mut Record) -> Result<bool> {
        let tdef = self.table_def(table)?;
        self.db_get(&tdef, rec)
    }

    pub fn set(&mut self, table: &str, rec: Record, mode: UpdateMode) -> Result<bool> {
        let tdef = self.table_def(table)?;
        self.db_update(&tdef, rec, mode)
    }

    pub fn insert(&mut self, table: &str, rec: Record) -> Result<bool> {
        self.set(table, rec, UpdateMode::InsertOnly)
    }

    pub fn update(&mut self, table: &str, rec: Record) -> Result<bool> {
        self.set(table, rec, UpdateMode::UpdateOnly)
    }

    pub fn upsert(&mut self, table: &str, rec: Record) -> Result<bool> {
        self.set(table, rec, UpdateMode::Upsert)
    }

    // Remove a row by primary key, reporting whether it existed.
    pub fn delete(&mut self, table: &str, rec: Record) -> Result<bool> {
        let tdef = self.table_def(table)?;
        let values = check_record(&tdef, &rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &values);
        self.kv.delete(&key)
    }

    fn table_def(&mut self, table: &str) -> Result<TableDef> {
        if let Some(tdef) = self.tables.get(table) {
            return Ok(tdef.clone());
        }
        let mut rec = Record::new();
        rec.add_bytes("name", table.as_bytes());
        if !self.db_get(&tdef_table(), &mut rec)? {
            bail!("table not found: {table}");
        }
        let Some(Value::Bytes(def)) = rec.get("def") else {
            bail!("bad table definition: {table}");
        };
        let tdef: TableDef =
            serde_json::from_slice(def).context("decode table definition")?;
        self.tables.insert(table.to_string(), tdef.clone());
        Ok(tdef)
    }

    fn db_get(&self, tdef: &TableDef, rec: &mut Record) -> Result<bool> {
        let values = check_record(tdef, rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &values);
        let Some(raw) = self.kv.get(&key) else {
            return Ok(false);
        };

        let rest = decode_values(&raw, &tdef.types[tdef.pkeys..])?;
        for (col, val) in tdef.cols[tdef.pkeys..].iter().zip(rest) {
            rec.cols.push(col.clone());
            rec.vals.push(val);
        }
        Ok(true)
    }

    fn db_update(&mut self, tdef: &TableDef, rec: Record, mode: UpdateMode) -> Result<bool> {
        let values = check_record(tdef, &rec, tdef.cols.len())?;
        let key = encode_key(tdef.prefix, &values[..tdef.pkeys]);
        let mut val = Vec::new();
        encode_values(&mut val, &values[tdef.pkeys..]);
        kv_update(&mut self.kv, &key, &val, mode)
    }
}

// Apply an update mode over the plain get/set operations. Returns
// whether the write happened.
pub(crate) fn kv_update(kv: &mut KV, key: &[u8], val: &[u8], mode: UpdateMode) -> Result<bool> {
    match mode {
        UpdateMode::Upsert => {
            kv.set(key, val)?;
            Ok(true)
        }
        UpdateMode::UpdateOnly => {
            if kv.get(key).is_none() {
                return Ok(false);
            }
            kv.set(key, val)?;
            Ok(true)
        }
        UpdateMode::InsertOnly => {
            if kv.get(key).is_some() {
                return Ok(false);
            }
            kv.set(key, val)?;
            Ok(true)
        }
    }
}

fn table_def_check(tdef: &TableDef) -> Result<()> {
    ensure!(!tdef.name.is_empty(), "empty table name");
    ensure!(
        !tdef.name.starts_with('@'),
        "reserved table name: {}",
        tdef.name
    );
    ensure!(!tdef.cols.is_empty(), "table {} has no columns", tdef.name);
    ensure!(
        tdef.cols.len() == tdef.types.len(),
        "table {} has mismatched columns and types",
        tdef.name
    );
    ensure!(
        tdef.pkeys >= 1 && tdef.pkeys <= tdef.cols.len(),
        "table {} has a bad primary key",
        tdef.name
    );
    ensure!(
        tdef.prefix == 0,
        "table prefix is assigned automatically"
    );
    Ok(())
}
