use tempfile::TempDir;
use tinykv::{Record, TableDef, Value, ValueType, DB};

fn test_table() -> TableDef {
    TableDef {
        name: "test".to_string(),
        types: vec![
            ValueType::Int64,
            ValueType::Bytes,
            ValueType::Int64,
            ValueType::Int64,
        ],
        cols: vec![
            "id".to_string(),
            "name".to_string(),
            "age".to_string(),
            "ext".to_string(),
        ],
        pkeys: 1,
        prefix: 0,
    }
}

fn row(id: i64, name: &[u8], age: i64, ext: i64) -> Record {
    let mut rec = Record::new();
    rec.add_int64("id", id)
        .add_bytes("name", name)
        .add_int64("age", age)
        .add_int64("ext", ext);
    rec
}

fn pk(id: i64) -> Record {
    let mut rec = Record::new();
    rec.add_int64("id", id);
    rec
}

#[test]
fn test_table_crud() {
    let dir = TempDir::new().unwrap();
    let mut db = DB::open(dir.path().join("test.db")).unwrap();

    db.table_new(&test_table()).unwrap();

    let mut probe = pk(1);
    assert!(!db.get("test", &mut probe).unwrap());

    assert!(db.insert("test", row(1, b"Bobby", 18, -1)).unwrap());
    assert!(!db.insert("test", row(1, b"Bobby", 18, -1)).unwrap());

    assert!(db.update("test", row(1, b"Bobby New", 18, -2)).unwrap());
    assert!(!db.update("test", row(2, b"Bobby New", 18, -2)).unwrap());

    assert!(!db.delete("test", pk(2)).unwrap());

    assert!(db.upsert("test", row(1, b"Bobby New", 18, -3)).unwrap());
    assert!(db.upsert("test", row(2, b"Bobby New", 18, -2)).unwrap());

    let mut rec = pk(2);
    assert!(db.get("test", &mut rec).unwrap());
    assert_eq!(rec.get("name").unwrap(), &Value::Bytes(b"Bobby New".to_vec()));
    assert_eq!(rec.get("age").unwrap(), &Value::Int64(18));
    assert_eq!(rec.get("ext").unwrap(), &Value::Int64(-2));

    let mut rec = pk(1);
    assert!(db.get("test", &mut rec).unwrap());
    assert_eq!(rec.get("ext").unwrap(), &Value::Int64(-3));

    assert!(db.delete("test", pk(1)).unwrap());
    assert!(db.delete("test", pk(2)).unwrap());
    assert!(!db.get("test", &mut pk(1)).unwrap());
}

#[test]
fn test_duplicate_table_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut db = DB::open(dir.path().join("test.db")).unwrap();

    db.table_new(&test_table()).unwrap();
    assert!(db.table_new(&test_table()).is_err());
}

#[test]
fn test_tables_get_distinct_prefixes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let mut db = DB::open(&path).unwrap();
        let mut first = test_table();
        first.name = "first".to_string();
        let mut second = test_table();
        second.name = "second".to_string();
        db.table_new(&first).unwrap();
        db.table_new(&second).unwrap();

        // same primary key in both tables, different rows
        db.insert("first", row(7, b"one", 1, 0)).unwrap();
        db.insert("second", row(7, b"two", 2, 0)).unwrap();
        db.close();
    }

    // definitions are persisted, not just cached
    let mut db = DB::open(&path).unwrap();
    let mut rec = pk(7);
    assert!(db.get("first", &mut rec).unwrap());
    assert_eq!(rec.get("name").unwrap(), &Value::Bytes(b"one".to_vec()));
    let mut rec = pk(7);
    assert!(db.get("second", &mut rec).unwrap());
    assert_eq!(rec.get("name").unwrap(), &Value::Bytes(b"two".to_vec()));
}

#[test]
fn test_unknown_table_errors() {
    let dir = TempDir::new().unwrap();
    let mut db = DB::open(dir.path().join("test.db")).unwrap();
    assert!(db.get("nope", &mut pk(1)).is_err());
}

#[test]
fn test_bytes_primary_keys_may_contain_any_byte() {
    let dir = TempDir::new().unwrap();
    let mut db = DB::open(dir.path().join("test.db")).unwrap();

    let tdef = TableDef {
        name: "blobs".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        prefix: 0,
    };
    db.table_new(&tdef).unwrap();

    let nasty = b"\x00\x01\x02nul\x00and\x01escape";
    let mut rec = Record::new();
    rec.add_bytes("key", nasty).add_bytes("val", b"found me");
    assert!(db.insert("blobs", rec).unwrap());

    let mut probe = Record::new();
    probe.add_bytes("key", nasty);
    assert!(db.get("blobs", &mut probe).unwrap());
    assert_eq!(probe.get("val").unwrap(), &Value::Bytes(b"found me".to_vec()));
}

#[test]
fn test_bad_definitions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut db = DB::open(dir.path().join("test.db")).unwrap();

    let mut no_cols = test_table();
    no_cols.cols.clear();
    no_cols.types.clear();
    assert!(db.table_new(&no_cols).is_err());

    let mut reserved = test_table();
    reserved.name = "@meta".to_string();
    assert!(db.table_new(&reserved).is_err());

    let mut preset_prefix = test_table();
    preset_prefix.prefix = 9;
    assert!(db.table_new(&preset_prefix).is_err());

    let mut bad_pk = test_table();
    bad_pk.pkeys = 0;
    assert!(db.table_new(&bad_pk).is_err());
}
