use crate::sstable::{
    ColumnChunkMeta, FOOTER_SIZE, Footer, RowGroupMeta, SSTABLE_VERSION, SSTableError, ZoneMap,
};
use crate::types::ValueType;

#[test]
fn footer_roundtrip() {
    let footer = Footer {
        meta_offset: 8192,
        meta_size: 321,
        rowgroup_count: 3,
        column_count: 4,
        primary_key_idx: 1,
        version: SSTABLE_VERSION,
    };
    let mut buf = Vec::new();
    footer.serialize(&mut buf);
    assert_eq!(buf.len(), FOOTER_SIZE);

    assert_eq!(Footer::deserialize(&buf).unwrap(), footer);
}

#[test]
fn footer_rejects_bad_magic() {
    let footer = Footer {
        meta_offset: 0,
        meta_size: 0,
        rowgroup_count: 0,
        column_count: 1,
        primary_key_idx: 0,
        version: SSTABLE_VERSION,
    };
    let mut buf = Vec::new();
    footer.serialize(&mut buf);
    let last = buf.len() - 1;
    buf[last] ^= 0xFF;

    assert!(matches!(
        Footer::deserialize(&buf),
        Err(SSTableError::Corrupt(_))
    ));
}

#[test]
fn footer_rejects_unknown_version() {
    let footer = Footer {
        meta_offset: 0,
        meta_size: 0,
        rowgroup_count: 0,
        column_count: 1,
        primary_key_idx: 0,
        version: 9,
    };
    let mut buf = Vec::new();
    footer.serialize(&mut buf);

    assert!(matches!(
        Footer::deserialize(&buf),
        Err(SSTableError::Corrupt(_))
    ));
}

#[test]
fn rowgroup_meta_roundtrip_mixed_schema() {
    let types = [ValueType::Int, ValueType::Double, ValueType::String];
    let meta = RowGroupMeta {
        offset: 4096,
        row_count: 100,
        columns: vec![
            ColumnChunkMeta {
                offset: 0,
                size: 400,
                zone: ZoneMap {
                    has_value: true,
                    min: 1i32.to_le_bytes().to_vec(),
                    max: 99i32.to_le_bytes().to_vec(),
                },
                has_nulls: false,
            },
            ColumnChunkMeta {
                offset: 400,
                size: 813,
                zone: ZoneMap {
                    has_value: true,
                    min: 0.5f64.to_le_bytes().to_vec(),
                    max: 9.5f64.to_le_bytes().to_vec(),
                },
                has_nulls: true,
            },
            ColumnChunkMeta {
                offset: 1213,
                size: 2000,
                zone: ZoneMap {
                    has_value: true,
                    min: b"aardvark".to_vec(),
                    max: b"zebra".to_vec(),
                },
                has_nulls: false,
            },
        ],
        bloom: vec![0xAB; 128],
        max_key: 99i32.to_le_bytes().to_vec(),
        key_column_offset: 3213,
        key_column_size: 400,
    };

    let mut blob = Vec::new();
    meta.serialize(&types, &mut blob);

    let mut offset = 0;
    let decoded = RowGroupMeta::deserialize(&blob, &mut offset, &types).unwrap();
    assert_eq!(offset, blob.len());
    assert_eq!(decoded, meta);
}

#[test]
fn absent_zone_roundtrips_as_absent() {
    let types = [ValueType::Int];
    let meta = RowGroupMeta {
        offset: 0,
        row_count: 5,
        columns: vec![ColumnChunkMeta::default()],
        bloom: Vec::new(),
        max_key: Vec::new(),
        key_column_offset: 20,
        key_column_size: 20,
    };

    let mut blob = Vec::new();
    meta.serialize(&types, &mut blob);

    let mut offset = 0;
    let decoded = RowGroupMeta::deserialize(&blob, &mut offset, &types).unwrap();
    assert!(!decoded.columns[0].zone.has_value);
    assert!(decoded.columns[0].zone.min.is_empty());
}

#[test]
fn truncated_blob_is_an_error() {
    let types = [ValueType::Int];
    let meta = RowGroupMeta {
        row_count: 1,
        columns: vec![ColumnChunkMeta::default()],
        ..Default::default()
    };
    let mut blob = Vec::new();
    meta.serialize(&types, &mut blob);
    blob.truncate(blob.len() / 2);

    let mut offset = 0;
    assert!(RowGroupMeta::deserialize(&blob, &mut offset, &types).is_err());
}
