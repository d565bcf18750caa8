use bytes::Bytes;
use codec::{DataType, DatumId, StructRegistry, TypeExtra, Value};
use proto::Refc;
use std::sync::Arc;
use store::{CreateProps, Error, Notifications, Store};

// A three-server topology in which this store is server index 0: it
// owns ids 1, 4, 7, 10, ...
fn shard() -> Store {
    Store::new(3, 0, true, Arc::new(StructRegistry::new()))
}

fn props(read: i64, write: i64) -> CreateProps {
    CreateProps {
        read_refcount: read,
        write_refcount: write,
        ..CreateProps::default()
    }
}

fn int_payload(v: i64) -> Bytes {
    codec::packed(&Value::Integer(v))
}

fn create_scalar(store: &mut Store, id: i64, read: i64, write: i64) {
    store
        .create(DatumId(id), DataType::Integer, TypeExtra::None, &props(read, write))
        .unwrap();
}

#[test]
fn simple_future_lifecycle() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);

    // A worker subscribes before the value arrives.
    assert!(store.subscribe(DatumId(1), None, 1).unwrap());

    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), None, DataType::Integer, &int_payload(42), Refc::new(0, 1), Refc::READ, &mut notifs)
        .unwrap();

    // The store closed the datum and drained the listener.
    assert_eq!(notifs.take_closes_of(DatumId(1)), vec![1]);

    // A read-consuming retrieve returns the value and collects it.
    let mut notifs = Notifications::new();
    let (ty, payload) = store
        .retrieve(DatumId(1), None, Refc::READ, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(ty, DataType::Integer);
    assert_eq!(
        codec::unpack(ty, &payload, &StructRegistry::new()).unwrap(),
        Value::Integer(42)
    );
    assert!(!store.contains(DatumId(1)));
    assert!(matches!(
        store.retrieve(DatumId(1), None, Refc::NONE, Refc::NONE, &mut notifs),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn container_insert_notifies_subscript_listeners() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Container,
            TypeExtra::Container {
                key: DataType::String,
                val: DataType::Integer,
            },
            &props(2, 1),
        )
        .unwrap();

    assert!(store.subscribe(DatumId(1), Some(b"k"), 1).unwrap());

    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), Some(b"k"), DataType::Integer, &int_payload(7), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();

    let (id, subscript, ranks) = notifs.insert.expect("insert listeners were drained");
    assert_eq!(id, DatumId(1));
    assert_eq!(subscript.as_ref(), b"k");
    assert_eq!(ranks, vec![1]);

    let mut notifs = Notifications::new();
    let (ty, payload) = store
        .retrieve(DatumId(1), Some(b"k"), Refc::NONE, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(ty, DataType::Integer);
    assert_eq!(
        codec::unpack(ty, &payload, &StructRegistry::new()).unwrap(),
        Value::Integer(7)
    );

    // Subscribing to a now-present subscript reports that no
    // notification will come.
    assert!(!store.subscribe(DatumId(1), Some(b"k"), 2).unwrap());
}

#[test]
fn container_reference_resolution_takes_referand_refcounts() {
    let mut store = shard();
    // The future the reference will point at.
    create_scalar(&mut store, 4, 2, 1);
    // A container of refs.
    store
        .create(
            DatumId(1),
            DataType::Container,
            TypeExtra::Container {
                key: DataType::String,
                val: DataType::Ref,
            },
            &props(2, 1),
        )
        .unwrap();

    // Register id 7 to receive the value of 1["x"].
    let registered = store
        .container_reference(DatumId(1), b"x", DatumId(7), DataType::Ref)
        .unwrap();
    assert!(registered.is_none());

    let mut notifs = Notifications::new();
    store
        .store(
            DatumId(1),
            Some(b"x"),
            DataType::Ref,
            &codec::packed(&Value::Ref(DatumId(4))),
            Refc::NONE,
            Refc::READ,
            &mut notifs,
        )
        .unwrap();

    // The pending reference surfaced, with the stored value attached.
    assert_eq!(notifs.references, vec![DatumId(7)]);
    let (value_type, value) = notifs.value.as_ref().expect("value rides with references");
    assert_eq!(*value_type, DataType::Ref);
    assert_eq!(
        codec::unpack(*value_type, value, &StructRegistry::new()).unwrap(),
        Value::Ref(DatumId(4))
    );

    // The referand gained one read reference on behalf of the new
    // reference, and the container released the subscription's one.
    assert_eq!(store.refcounts(DatumId(4)), Some((3, 1)));
    assert_eq!(store.refcounts(DatumId(1)), Some((1, 1)));
}

#[test]
fn second_reference_on_same_subscript_reuses_the_held_refcount() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Container,
            TypeExtra::Container {
                key: DataType::String,
                val: DataType::Integer,
            },
            &props(3, 1),
        )
        .unwrap();

    assert!(store
        .container_reference(DatumId(1), b"x", DatumId(7), DataType::Integer)
        .unwrap()
        .is_none());
    assert_eq!(store.refcounts(DatumId(1)), Some((3, 1)));

    // A second subscriber's extra read reference is released at once.
    assert!(store
        .container_reference(DatumId(1), b"x", DatumId(10), DataType::Integer)
        .unwrap()
        .is_none());
    assert_eq!(store.refcounts(DatumId(1)), Some((2, 1)));

    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), Some(b"x"), DataType::Integer, &int_payload(5), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();
    let mut references = notifs.references.clone();
    references.sort();
    assert_eq!(references, vec![DatumId(7), DatumId(10)]);
    // Only the single held reference was released.
    assert_eq!(store.refcounts(DatumId(1)), Some((1, 1)));
}

#[test]
fn refcount_gc_destroys_and_second_lookup_is_not_found() {
    let mut store = shard();
    store
        .create(DatumId(7), DataType::String, TypeExtra::None, &props(1, 1))
        .unwrap();

    let mut notifs = Notifications::new();
    store
        .store(
            DatumId(7),
            None,
            DataType::String,
            &codec::packed(&Value::String("hi".to_string())),
            Refc::new(0, 1),
            Refc::READ,
            &mut notifs,
        )
        .unwrap();

    store
        .refcount_incr(DatumId(7), Refc::new(-1, 0), &mut notifs)
        .unwrap();
    assert!(!store.contains(DatumId(7)));
    assert!(matches!(
        store.retrieve(DatumId(7), None, Refc::NONE, Refc::NONE, &mut notifs),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn collection_releases_embedded_referands_recursively() {
    let mut store = shard();
    create_scalar(&mut store, 4, 2, 1);

    store
        .create(DatumId(1), DataType::Ref, TypeExtra::None, &props(1, 1))
        .unwrap();
    let mut notifs = Notifications::new();
    store
        .store(
            DatumId(1),
            None,
            DataType::Ref,
            &codec::packed(&Value::Ref(DatumId(4))),
            Refc::new(0, 1),
            Refc::READ,
            &mut notifs,
        )
        .unwrap();

    // Collecting the ref releases one read reference of its target.
    let mut notifs = Notifications::new();
    store
        .refcount_incr(DatumId(1), Refc::new(-1, 0), &mut notifs)
        .unwrap();
    assert!(!store.contains(DatumId(1)));
    assert_eq!(store.refcounts(DatumId(4)), Some((1, 1)));
}

#[test]
fn retrieve_with_acquire_scavenges_a_dying_datum() {
    let mut store = shard();
    create_scalar(&mut store, 4, 1, 1);
    let mut notifs = Notifications::new();
    store
        .store(DatumId(4), None, DataType::Integer, &int_payload(9), Refc::new(0, 1), Refc::READ, &mut notifs)
        .unwrap();

    store
        .create(DatumId(1), DataType::Ref, TypeExtra::None, &props(1, 1))
        .unwrap();
    store
        .store(
            DatumId(1),
            None,
            DataType::Ref,
            &codec::packed(&Value::Ref(DatumId(4))),
            Refc::new(0, 1),
            Refc::READ,
            &mut notifs,
        )
        .unwrap();

    // Consume the ref while acquiring its target: the read reference
    // transfers rather than bouncing through an increment.
    let mut notifs = Notifications::new();
    let (ty, payload) = store
        .retrieve(DatumId(1), None, Refc::READ, Refc::READ, &mut notifs)
        .unwrap();
    assert_eq!(ty, DataType::Ref);
    assert_eq!(
        codec::unpack(ty, &payload, &StructRegistry::new()).unwrap(),
        Value::Ref(DatumId(4))
    );
    assert!(!store.contains(DatumId(1)));
    assert_eq!(store.refcounts(DatumId(4)), Some((1, 0)));
}

#[test]
fn remote_referands_are_deferred_for_forwarding() {
    let mut store = shard();
    // Id 2 belongs to server index 1, not this shard.
    store
        .create(DatumId(1), DataType::Ref, TypeExtra::None, &props(1, 1))
        .unwrap();
    let mut notifs = Notifications::new();
    store
        .store(
            DatumId(1),
            None,
            DataType::Ref,
            &codec::packed(&Value::Ref(DatumId(2))),
            Refc::new(0, 1),
            Refc::READ,
            &mut notifs,
        )
        .unwrap();

    let mut notifs = Notifications::new();
    store
        .refcount_incr(DatumId(1), Refc::new(-1, 0), &mut notifs)
        .unwrap();
    assert_eq!(notifs.remote_refcounts, vec![(DatumId(2), Refc::new(-1, 0))]);
}

#[test]
fn insert_atomic_reserves_and_fills_once() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Container,
            TypeExtra::Container {
                key: DataType::String,
                val: DataType::Integer,
            },
            &props(1, 1),
        )
        .unwrap();

    let first = store.insert_atomic(DatumId(1), b"slot", false).unwrap();
    assert!(first.created);
    assert!(!first.value_present);

    let second = store.insert_atomic(DatumId(1), b"slot", false).unwrap();
    assert!(!second.created);
    assert!(!second.value_present);

    // Filling a reserved slot is not a double write.
    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), Some(b"slot"), DataType::Integer, &int_payload(7), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();

    let third = store.insert_atomic(DatumId(1), b"slot", true).unwrap();
    assert!(!third.created);
    assert!(third.value_present);
    let (ty, payload) = third.value.unwrap();
    assert_eq!(
        codec::unpack(ty, &payload, &StructRegistry::new()).unwrap(),
        Value::Integer(7)
    );

    // A second true store is rejected.
    assert!(matches!(
        store.store(DatumId(1), Some(b"slot"), DataType::Integer, &int_payload(8), Refc::NONE, Refc::READ, &mut notifs),
        Err(Error::DoubleWrite(_))
    ));
}

#[test]
fn unset_reads_and_double_writes_are_rejected() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);

    let mut notifs = Notifications::new();
    assert!(matches!(
        store.retrieve(DatumId(1), None, Refc::NONE, Refc::NONE, &mut notifs),
        Err(Error::Unset(_))
    ));
    assert!(!store.exists(DatumId(1), None).unwrap());

    store
        .store(DatumId(1), None, DataType::Integer, &int_payload(1), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();
    assert!(store.exists(DatumId(1), None).unwrap());
    assert!(matches!(
        store.store(DatumId(1), None, DataType::Integer, &int_payload(2), Refc::NONE, Refc::READ, &mut notifs),
        Err(Error::DoubleWrite(_))
    ));

    assert!(matches!(
        store.create(DatumId(1), DataType::Integer, TypeExtra::None, &props(1, 1)),
        Err(Error::DoubleDeclare(_))
    ));
}

#[test]
fn closed_data_rejects_stores_and_subscriptions() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);
    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), None, DataType::Integer, &int_payload(3), Refc::new(0, 1), Refc::READ, &mut notifs)
        .unwrap();

    // Closed: write refcount reached zero.
    assert_eq!(store.refcounts(DatumId(1)), Some((1, 0)));
    assert!(!store.subscribe(DatumId(1), None, 2).unwrap());
}

#[test]
fn permanent_data_ignores_read_counts_and_survives() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Integer,
            TypeExtra::None,
            &CreateProps {
                read_refcount: 1,
                write_refcount: 1,
                permanent: true,
                ..CreateProps::default()
            },
        )
        .unwrap();

    let mut notifs = Notifications::new();
    // Read effects are silently dropped.
    store
        .refcount_incr(DatumId(1), Refc::new(-1, 0), &mut notifs)
        .unwrap();
    assert_eq!(store.refcounts(DatumId(1)), Some((1, 1)));

    // Closing still notifies, but never collects.
    store
        .refcount_incr(DatumId(1), Refc::new(0, -1), &mut notifs)
        .unwrap();
    assert!(store.contains(DatumId(1)));
}

#[test]
fn marking_permanent_after_create_prevents_collection() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Integer,
            TypeExtra::None,
            &CreateProps {
                read_refcount: 0,
                write_refcount: 1,
                ..CreateProps::default()
            },
        )
        .unwrap();
    store.permanent(DatumId(1)).unwrap();

    // Without the permanent mark, this write release would take both
    // counts to zero and collect the datum.
    let mut notifs = Notifications::new();
    store
        .refcount_incr(DatumId(1), Refc::new(0, -1), &mut notifs)
        .unwrap();
    assert!(store.contains(DatumId(1)));
}

#[test]
fn refcount_below_zero_is_an_error() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);
    let mut notifs = Notifications::new();
    assert!(matches!(
        store.refcount_incr(DatumId(1), Refc::new(-2, 0), &mut notifs),
        Err(Error::RefcountNegative(_))
    ));
}

#[test]
fn enumerate_slices_containers_and_multisets() {
    let mut store = shard();
    store
        .create(
            DatumId(1),
            DataType::Container,
            TypeExtra::Container {
                key: DataType::String,
                val: DataType::Integer,
            },
            &props(1, 1),
        )
        .unwrap();
    let mut notifs = Notifications::new();
    for (key, v) in [("a", 1i64), ("b", 2), ("c", 3)] {
        store
            .store(DatumId(1), Some(key.as_bytes()), DataType::Integer, &int_payload(v), Refc::NONE, Refc::READ, &mut notifs)
            .unwrap();
    }

    let all = store
        .enumerate(DatumId(1), -1, 0, true, true, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(all.records, 3);

    let registry = StructRegistry::new();
    let mut reader = codec::SliceReader::new(&all.payload, true, true, all.val_type, &registry);
    let mut seen = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        seen.push((entry.key.unwrap(), entry.value.unwrap()));
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, b"a".to_vec());

    // An offset slice is stable with respect to the full enumeration.
    let middle = store
        .enumerate(DatumId(1), 1, 1, true, true, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(middle.records, 1);
    let mut reader = codec::SliceReader::new(&middle.payload, true, true, middle.val_type, &registry);
    assert_eq!(
        reader.next_entry().unwrap().unwrap().key.unwrap(),
        seen[1].0
    );

    // Multisets enumerate values only.
    store
        .create(
            DatumId(4),
            DataType::Multiset,
            TypeExtra::Multiset { elem: DataType::Integer },
            &props(1, 1),
        )
        .unwrap();
    store
        .store(DatumId(4), None, DataType::Integer, &int_payload(5), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();
    let elems = store
        .enumerate(DatumId(4), -1, 0, false, true, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(elems.records, 1);
    assert!(store
        .enumerate(DatumId(4), -1, 0, true, true, Refc::NONE, &mut notifs)
        .is_err());
}

#[test]
fn lock_is_exclusive_until_released() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);

    assert!(store.lock(DatumId(1), 0).unwrap());
    assert!(!store.lock(DatumId(1), 2).unwrap());
    store.unlock(DatumId(1)).unwrap();
    assert!(store.lock(DatumId(1), 2).unwrap());
    store.unlock(DatumId(1)).unwrap();
    assert!(matches!(store.unlock(DatumId(1)), Err(Error::NotFound(_))));
}

#[test]
fn unique_ids_follow_the_server_stride_and_never_repeat() {
    let mut store = shard();
    let a = store.unique().unwrap();
    let b = store.unique().unwrap();
    let c = store.unique().unwrap();
    assert_eq!((a, b, c), (DatumId(1), DatumId(4), DatumId(7)));
    for id in [a, b, c] {
        assert!(store.owns(id));
    }

    let mut minted = std::collections::HashSet::new();
    for _ in 0..1000 {
        assert!(minted.insert(store.unique().unwrap()));
    }
}

#[test]
fn disjoint_refcount_changes_commute() {
    let ops = [
        (DatumId(1), Refc::new(1, 0)),
        (DatumId(4), Refc::new(-1, 0)),
        (DatumId(1), Refc::new(0, 1)),
        (DatumId(4), Refc::new(1, 0)),
        (DatumId(1), Refc::new(-1, 0)),
    ];

    let run = |order: Vec<usize>| {
        let mut store = shard();
        create_scalar(&mut store, 1, 4, 4);
        create_scalar(&mut store, 4, 4, 4);
        let mut notifs = Notifications::new();
        for i in order {
            let (id, change) = ops[i];
            store.refcount_incr(id, change, &mut notifs).unwrap();
        }
        (store.refcounts(DatumId(1)), store.refcounts(DatumId(4)))
    };

    let forward = run(vec![0, 1, 2, 3, 4]);
    let shuffled = run(vec![3, 1, 4, 0, 2]);
    let reversed = run(vec![4, 3, 2, 1, 0]);
    assert_eq!(forward, shuffled);
    assert_eq!(forward, reversed);
}

#[test]
fn leak_report_lists_surviving_datums() {
    let mut store = shard();
    create_scalar(&mut store, 1, 1, 1);
    store
        .create(
            DatumId(4),
            DataType::Integer,
            TypeExtra::None,
            &CreateProps {
                permanent: true,
                ..CreateProps::default()
            },
        )
        .unwrap();

    let leaked: Vec<_> = store.leaks().map(|(id, _)| id).collect();
    assert_eq!(leaked, vec![DatumId(1)]);
}

#[test]
fn struct_fields_assign_once_and_read_back() {
    let mut registry = StructRegistry::new();
    registry
        .register(
            codec::StructTypeId(3),
            codec::StructType {
                name: "job".to_string(),
                fields: vec![
                    codec::StructField {
                        name: "rank".to_string(),
                        val_type: DataType::Integer,
                    },
                    codec::StructField {
                        name: "name".to_string(),
                        val_type: DataType::String,
                    },
                ],
            },
        )
        .unwrap();
    let registry = Arc::new(registry);
    let mut store = Store::new(3, 0, true, registry.clone());

    store
        .create(
            DatumId(1),
            DataType::Struct,
            TypeExtra::Struct {
                struct_type: codec::StructTypeId(3),
            },
            &props(1, 1),
        )
        .unwrap();

    let mut notifs = Notifications::new();
    store
        .store(DatumId(1), Some(b"rank"), DataType::Integer, &int_payload(4), Refc::NONE, Refc::READ, &mut notifs)
        .unwrap();

    // Fields assign at most once.
    assert!(matches!(
        store.store(DatumId(1), Some(b"rank"), DataType::Integer, &int_payload(5), Refc::NONE, Refc::READ, &mut notifs),
        Err(Error::DoubleWrite(_))
    ));
    // Unknown fields and unset fields are distinct failures.
    assert!(store
        .store(DatumId(1), Some(b"nope"), DataType::Integer, &int_payload(5), Refc::NONE, Refc::READ, &mut notifs)
        .is_err());
    assert!(matches!(
        store.retrieve(DatumId(1), Some(b"name"), Refc::NONE, Refc::NONE, &mut notifs),
        Err(Error::Unset(_))
    ));

    let (ty, payload) = store
        .retrieve(DatumId(1), Some(b"rank"), Refc::NONE, Refc::NONE, &mut notifs)
        .unwrap();
    assert_eq!(ty, DataType::Integer);
    assert_eq!(
        codec::unpack(ty, &payload, &registry).unwrap(),
        Value::Integer(4)
    );
}

#[test]
fn creation_with_dead_counts_is_skipped() {
    let mut store = shard();
    store
        .create(DatumId(1), DataType::Integer, TypeExtra::None, &props(0, 0))
        .unwrap();
    assert!(!store.contains(DatumId(1)));
}

#[test]
fn negative_ids_are_rejected() {
    let mut store = shard();
    assert!(matches!(
        store.create(DatumId(-5), DataType::Integer, TypeExtra::None, &props(1, 1)),
        Err(Error::Invalid(_))
    ));
}
