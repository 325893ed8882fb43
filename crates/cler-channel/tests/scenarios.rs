use cler_channel::Channel;

#[test]
fn round_trip_small() {
    let ch = Channel::<i32>::new(8).unwrap();
    for v in 1..=8 {
        ch.push(v);
    }
    let mut out = Vec::new();
    for _ in 0..8 {
        out.push(ch.pop());
    }
    assert_eq!(out, (1..=8).collect::<Vec<_>>());
    assert!(ch.empty());
    assert_eq!(ch.space(), 8);
}

#[test]
fn wraparound() {
    let ch = Channel::<i32>::new(6).unwrap();
    for v in 1..=4 {
        ch.push(v);
    }
    for _ in 0..2 {
        ch.pop();
    }
    for v in 5..=8 {
        ch.push(v);
    }
    let mut out = Vec::new();
    while let Some(v) = ch.try_pop() {
        out.push(v);
    }
    assert_eq!(out, vec![3, 4, 5, 6, 7, 8]);
}

#[test]
fn force_overwrite() {
    let ch = Channel::<i32>::new(4).unwrap();
    for v in 1..=4 {
        ch.push(v);
    }
    ch.force_push(10);
    let mut out = Vec::new();
    while let Some(v) = ch.try_pop() {
        out.push(v);
    }
    assert_eq!(out, vec![2, 3, 4, 10]);
}

#[test]
fn doubly_mapped_contiguity_if_available() {
    let page_elements = cler_platform::page_size() / std::mem::size_of::<f32>();
    let ch = Channel::<f32>::new(page_elements).unwrap();
    if !ch.is_doubly_mapped() {
        // Platform (or sandbox) doesn't support doubly-mapped buffers; the
        // standard-buffer fallback is exercised by the other scenario tests.
        return;
    }

    let near_end = ch.capacity() - 50;
    for i in 0..near_end {
        ch.push(i as f32);
    }
    for _ in 0..(near_end - 100) {
        ch.pop();
    }
    let wrap_count = 200;
    for i in 0..wrap_count {
        ch.push((near_end + i) as f32);
    }

    let expected_total = ch.size();
    let span = ch.read_dbf().expect("doubly-mapped channel should yield a contiguous span");
    assert_eq!(span.len(), expected_total);

    let mut expected = (near_end - 100) as f32;
    for &v in span.iter() {
        assert_eq!(v, expected);
        expected += 1.0;
    }
}
