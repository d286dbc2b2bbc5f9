#![no_main]

use std::collections::VecDeque;

use faultring_core::record::{EncodedSlot, Record, SLOT_SIZE, Severity};
use faultring_core::ring_store::RingStore;
use libfuzzer_sys::fuzz_target;

fn text_from(data: &[u8], len: u8) -> String {
    let take = data.len().min(usize::from(len));
    String::from_utf8_lossy(&data[..take]).into_owned()
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 || data.len() > 65_536 {
        return;
    }

    // Arbitrary bytes must always decode without panicking.
    let _ = Record::decode(data);

    let capacity = usize::from(data[0] % 8) + 1;
    let size = RingStore::<Vec<u8>>::required_size(capacity) as usize;
    let Ok(mut store) = RingStore::format(vec![0u8; size], capacity, 0, 1) else {
        return;
    };
    let mut model: VecDeque<(i32, String)> = VecDeque::new();
    let mut ts = 1i64;

    let mut rest = &data[1..];
    while rest.len() >= 3 {
        let (op, origin, len) = (rest[0], rest[1], rest[2]);
        rest = &rest[3..];
        match op % 4 {
            0 | 1 => {
                let message = text_from(rest, len);
                let origin = i32::from(origin % 4);
                let mut slot = EncodedSlot::new(origin, Severity::Error, "", &message, &message);
                ts += i64::from(op);
                store.append(&mut slot, ts).expect("append");
                if model.len() == capacity {
                    model.pop_front();
                }
                model.push_back((origin, slot.to_record().error_message));
            }
            2 => {
                store.clear().expect("clear");
                model.clear();
            }
            _ => {
                let origin = i32::from(origin % 4);
                if let Some(index) = store.latest_slot_for(origin).expect("scan") {
                    let record = store.record(index).expect("record").expect("live");
                    assert_eq!(record.origin_id, origin);
                } else {
                    assert!(model.iter().all(|(o, _)| *o != origin));
                }
            }
        }

        let stats = store.stats().expect("stats");
        assert_eq!(stats.live, model.len());
        assert!(stats.write_cursor < capacity);
    }

    let mut snapshot = vec![0u8; capacity * SLOT_SIZE];
    store.copy_slots_into(&mut snapshot).expect("snapshot");
    let mut live: Vec<String> = snapshot
        .chunks_exact(SLOT_SIZE)
        .map(Record::decode)
        .filter(Record::is_live)
        .map(|r| r.error_message)
        .collect();
    let mut expected: Vec<String> = model.into_iter().map(|(_, m)| m).collect();
    live.sort();
    expected.sort();
    assert_eq!(live, expected);
});
