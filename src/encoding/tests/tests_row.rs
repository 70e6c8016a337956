use crate::encoding::{
    EncodingError, append_column, decode_column, decode_row, encode_row, read_u32,
};

#[test]
fn row_roundtrip_all_types() {
    let key = 42i32.to_le_bytes();
    let score = 3.75f64.to_le_bytes();
    let name = b"aurora".as_slice();
    let row = encode_row(&[&key, &score, name]);

    let values = decode_row(&row, 3).unwrap();
    assert_eq!(values[0], key);
    assert_eq!(values[1], score);
    assert_eq!(values[2], name);
}

#[test]
fn null_column_is_empty_slice() {
    let key = 1i32.to_le_bytes();
    let row = encode_row(&[&key, b"", b"tail"]);

    let values = decode_row(&row, 3).unwrap();
    assert!(values[1].is_empty());
    assert_eq!(values[2], b"tail");
}

#[test]
fn decode_column_skips_preceding_columns() {
    let row = encode_row(&[b"first", b"", b"third"]);
    assert_eq!(decode_column(&row, 0, 3).unwrap(), b"first");
    assert_eq!(decode_column(&row, 1, 3).unwrap(), b"");
    assert_eq!(decode_column(&row, 2, 3).unwrap(), b"third");
}

#[test]
fn decode_column_rejects_out_of_range_index() {
    let row = encode_row(&[b"only"]);
    assert!(matches!(
        decode_column(&row, 3, 1),
        Err(EncodingError::ColumnOutOfRange { index: 3, count: 1 })
    ));
}

#[test]
fn truncated_row_reports_eof() {
    let mut row = Vec::new();
    append_column(&mut row, b"whole");
    row.truncate(row.len() - 2);
    assert!(matches!(
        decode_row(&row, 1),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}

#[test]
fn absurd_length_is_rejected() {
    let row = u32::MAX.to_le_bytes().to_vec();
    assert!(matches!(
        decode_row(&row, 1),
        Err(EncodingError::LengthOverflow(_))
    ));
}

#[test]
fn read_u32_advances_offset() {
    let buf = [1u8, 0, 0, 0, 2, 0, 0, 0];
    let mut offset = 0;
    assert_eq!(read_u32(&buf, &mut offset).unwrap(), 1);
    assert_eq!(read_u32(&buf, &mut offset).unwrap(), 2);
    assert!(read_u32(&buf, &mut offset).is_err());
}
