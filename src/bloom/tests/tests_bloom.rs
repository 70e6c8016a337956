use crate::bloom::{BloomFilter, BloomFilterBuilder};

#[test]
fn inserted_keys_are_always_maybe_present() {
    let mut builder = BloomFilterBuilder::new(1000);
    for i in 0i32..1000 {
        builder.add_key(&i.to_le_bytes());
    }
    let data = builder.finish();

    let filter = BloomFilter::new(&data);
    for i in 0i32..1000 {
        assert!(filter.may_contain(&i.to_le_bytes()), "lost key {i}");
    }
}

#[test]
fn false_positive_rate_is_reasonable() {
    let mut builder = BloomFilterBuilder::new(10_000);
    for i in 0i32..10_000 {
        builder.add_key(&i.to_le_bytes());
    }
    let data = builder.finish();
    let filter = BloomFilter::new(&data);

    let mut false_positives = 0;
    for i in 10_000i32..20_000 {
        if filter.may_contain(&i.to_le_bytes()) {
            false_positives += 1;
        }
    }
    // 12 bits/key with 7 probes lands around 1%; 5% is a safe ceiling.
    assert!(
        false_positives < 500,
        "false positive rate too high: {false_positives}/10000"
    );
}

#[test]
fn data_size_is_whole_blocks() {
    for keys in [1usize, 10, 100, 5000] {
        let data = BloomFilterBuilder::new(keys).finish();
        assert!(!data.is_empty());
        assert_eq!(data.len() % 64, 0, "keys={keys}");
    }
}

#[test]
fn empty_or_damaged_filter_never_excludes() {
    let filter = BloomFilter::new(&[]);
    assert!(filter.may_contain(b"anything"));

    // Not a multiple of the block size.
    let odd = vec![0u8; 63];
    let filter = BloomFilter::new(&odd);
    assert!(filter.may_contain(b"anything"));
}

#[test]
fn string_keys_work() {
    let mut builder = BloomFilterBuilder::new(100);
    for i in 0..100 {
        builder.add_key(format!("user_{i}").as_bytes());
    }
    let data = builder.finish();
    let filter = BloomFilter::new(&data);

    for i in 0..100 {
        assert!(filter.may_contain(format!("user_{i}").as_bytes()));
    }
    assert!(!filter.may_contain(b"definitely_not_in_any_block_9999999"));
}
