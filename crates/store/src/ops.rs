use crate::refcount::Scavenge;
use crate::{subscript_repr, CreateProps, Datum, Error, Notifications, Result};
use bytes::Bytes;
use codec::{DataType, DatumId, StructRegistry, TypeExtra, Value};
use proto::Refc;
use std::collections::HashMap;
use std::sync::Arc;

/// One server's shard of the data store.
pub struct Store {
    pub(crate) servers: usize,
    pub(crate) server_index: usize,
    pub(crate) read_refcount_enabled: bool,
    pub(crate) registry: Arc<StructRegistry>,
    pub(crate) datums: HashMap<DatumId, Datum>,
    /// Ranks awaiting presence of a container subscript.
    index_listeners: HashMap<(DatumId, Box<[u8]>), Vec<i32>>,
    /// Datum ids to be assigned when a subscript becomes present. Each
    /// populated entry holds one read reference on its container.
    index_references: HashMap<(DatumId, Box<[u8]>), Vec<DatumId>>,
    pub(crate) locked: HashMap<DatumId, i32>,
    unique: i64,
    last_id: i64,
}

/// Result of an enumerate: a packed linear slice of entries.
#[derive(Debug)]
pub struct EnumerateResult {
    pub records: usize,
    pub key_type: DataType,
    pub val_type: DataType,
    pub payload: Vec<u8>,
}

/// Result of an atomic reserve.
#[derive(Debug)]
pub struct InsertAtomicResult {
    pub created: bool,
    pub value_present: bool,
    /// The packed existing value, when present and requested.
    pub value: Option<(DataType, Bytes)>,
}

impl Store {
    pub fn new(
        servers: usize,
        server_index: usize,
        read_refcount_enabled: bool,
        registry: Arc<StructRegistry>,
    ) -> Self {
        assert!(server_index < servers);
        Self {
            servers,
            server_index,
            read_refcount_enabled,
            registry,
            datums: HashMap::new(),
            index_listeners: HashMap::new(),
            index_references: HashMap::new(),
            locked: HashMap::new(),
            // Zero is the null id, so the first server's stride starts
            // one full step in.
            unique: server_index as i64 + 1,
            last_id: i64::MAX - servers as i64 - 1,
        }
    }

    pub fn registry(&self) -> &Arc<StructRegistry> {
        &self.registry
    }

    /// Whether this shard owns `id`.
    pub fn owns(&self, id: DatumId) -> bool {
        (id.0 - 1).rem_euclid(self.servers as i64) == self.server_index as i64
    }

    pub fn contains(&self, id: DatumId) -> bool {
        self.datums.contains_key(&id)
    }

    pub fn refcounts(&self, id: DatumId) -> Option<(i64, i64)> {
        self.datums
            .get(&id)
            .map(|d| (d.read_refcount, d.write_refcount))
    }

    pub fn len(&self) -> usize {
        self.datums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.is_empty()
    }

    fn datum(&self, id: DatumId) -> Result<&Datum> {
        if id.is_null() {
            return Err(Error::NullId);
        }
        self.datums.get(&id).ok_or(Error::NotFound(id))
    }

    /// Mint the next unused id in this server's stride.
    pub fn unique(&mut self) -> Result<DatumId> {
        if self.unique >= self.last_id {
            return Err(Error::Limit("datum ids exhausted"));
        }
        let id = DatumId(self.unique);
        self.unique += self.servers as i64;
        Ok(id)
    }

    /// Create a datum. A null `id` mints a fresh one. Creation is
    /// skipped entirely when both initial counts are non-positive: the
    /// datum is considered already dead.
    pub fn create(
        &mut self,
        id: DatumId,
        data_type: DataType,
        extra: TypeExtra,
        props: &CreateProps,
    ) -> Result<DatumId> {
        let id = if id.is_null() { self.unique()? } else { id };
        if id.0 <= 0 {
            return Err(Error::Invalid("datum ids must be positive"));
        }
        if self.datums.contains_key(&id) {
            return Err(Error::DoubleDeclare(id));
        }
        if props.read_refcount < 0 || props.write_refcount < 0 {
            return Err(Error::Invalid("initial refcounts must not be negative"));
        }
        tracing::debug!(
            %id, %data_type,
            r = props.read_refcount, w = props.write_refcount,
            "create"
        );
        if props.read_refcount == 0 && props.write_refcount == 0 {
            tracing::debug!(%id, "skipped creation of dead datum");
            return Ok(id);
        }

        let mut datum = Datum::new(data_type, extra, props);
        match data_type {
            DataType::Container => {
                let TypeExtra::Container { key, val } = extra else {
                    return Err(Error::Invalid("container creation requires key and value types"));
                };
                datum.value = Some(Value::Container(codec::Container::new(key, val)));
            }
            DataType::Multiset => {
                let TypeExtra::Multiset { elem } = extra else {
                    return Err(Error::Invalid("multiset creation requires an element type"));
                };
                datum.value = Some(Value::Multiset(codec::Multiset::new(elem)));
            }
            DataType::Struct => {
                let TypeExtra::Struct { struct_type } = extra else {
                    return Err(Error::Invalid("struct creation requires a struct type"));
                };
                // Validate the type now so stores cannot fail later on
                // an unregistered type.
                let () = self.registry.lookup(struct_type).map(|_| ())?;
            }
            DataType::Null => return Err(Error::Invalid("cannot create a null-typed datum")),
            _ => (),
        }
        self.datums.insert(id, datum);
        Ok(id)
    }

    pub fn exists(&self, id: DatumId, subscript: Option<&[u8]>) -> Result<bool> {
        match subscript {
            None => Ok(self.datums.get(&id).map(|d| d.is_set()).unwrap_or(false)),
            Some(subscript) => {
                let datum = self.datum(id)?;
                let Some(Value::Container(c)) = &datum.value else {
                    return Err(Error::WrongType {
                        id,
                        expected: DataType::Container,
                        found: datum.data_type,
                    });
                };
                // A reserved-but-unlinked cell holds no readable value.
                Ok(matches!(c.members.get(subscript), Some(Some(_))))
            }
        }
    }

    pub fn typeof_(&self, id: DatumId) -> Result<DataType> {
        Ok(self.datum(id)?.data_type)
    }

    pub fn container_typeof(&self, id: DatumId) -> Result<(DataType, DataType)> {
        let datum = self.datum(id)?;
        match datum.extra {
            TypeExtra::Container { key, val } => Ok((key, val)),
            _ => Err(Error::WrongType {
                id,
                expected: DataType::Container,
                found: datum.data_type,
            }),
        }
    }

    /// Mark a datum permanent after the fact.
    pub fn permanent(&mut self, id: DatumId) -> Result<()> {
        let datum = self.datums.get_mut(&id).ok_or(Error::NotFound(id))?;
        datum.permanent = true;
        Ok(())
    }

    /// Store a value, or install a container entry / append a multiset
    /// element when a subscript is given. `decr` is applied to this
    /// datum once the write lands; `store_rc` is the per-reference
    /// count taken on embedded referands when pending references
    /// resolve against the inserted value.
    pub fn store(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        data_type: DataType,
        payload: &[u8],
        decr: Refc,
        store_rc: Refc,
        notifs: &mut Notifications,
    ) -> Result<()> {
        if decr.read < 0 || decr.write < 0 {
            return Err(Error::Invalid("store decrements must not be negative"));
        }
        let registry = self.registry.clone();

        enum FollowUp {
            None,
            Insert { subscript: Box<[u8]>, val_type: DataType },
        }

        let follow_up = {
            let datum = self.datums.get_mut(&id).ok_or(Error::NotFound(id))?;
            if datum.write_refcount <= 0 {
                return Err(Error::DoubleWrite(id));
            }

            match (datum.data_type, subscript) {
                (DataType::Multiset, Some(_)) => {
                    return Err(Error::Invalid("multiset append takes no subscript"));
                }
                (DataType::Multiset, None) => {
                    let Some(Value::Multiset(m)) = &mut datum.value else {
                        return Err(Error::Unset(id));
                    };
                    if data_type != m.elem_type {
                        return Err(Error::WrongType {
                            id,
                            expected: m.elem_type,
                            found: data_type,
                        });
                    }
                    m.elems.push(codec::unpack(data_type, payload, &registry)?);
                    tracing::debug!(%id, elems = m.elems.len(), "multiset append");
                    FollowUp::None
                }
                (DataType::Container, Some(subscript)) => {
                    let Some(Value::Container(c)) = &mut datum.value else {
                        return Err(Error::Unset(id));
                    };
                    if data_type != c.val_type {
                        return Err(Error::WrongType {
                            id,
                            expected: c.val_type,
                            found: data_type,
                        });
                    }
                    let value = codec::unpack(data_type, payload, &registry)?;
                    match c.members.get_mut(subscript) {
                        Some(Some(_)) => {
                            return Err(Error::DoubleWrite(id));
                        }
                        Some(cell) => {
                            // Fill a cell reserved by an atomic insert.
                            tracing::debug!(%id, subscript = %subscript_repr(subscript), "linking reserved entry");
                            *cell = Some(value);
                        }
                        None => {
                            tracing::debug!(%id, subscript = %subscript_repr(subscript), "new container entry");
                            c.members.insert(subscript.into(), Some(value));
                        }
                    }
                    FollowUp::Insert {
                        subscript: subscript.into(),
                        val_type: c.val_type,
                    }
                }
                (DataType::Container, None) => {
                    // A whole-container store merges entries into the shell.
                    let Some(Value::Container(c)) = &mut datum.value else {
                        return Err(Error::Unset(id));
                    };
                    let unpacked = codec::unpack(DataType::Container, payload, &registry)?;
                    let Value::Container(incoming) = unpacked else { unreachable!() };
                    if incoming.key_type != c.key_type || incoming.val_type != c.val_type {
                        return Err(Error::WrongType {
                            id,
                            expected: c.val_type,
                            found: incoming.val_type,
                        });
                    }
                    for (key, cell) in incoming.members {
                        match c.members.get(&key) {
                            Some(Some(_)) => return Err(Error::DoubleWrite(id)),
                            _ => {
                                c.members.insert(key, cell);
                            }
                        }
                    }
                    FollowUp::None
                }
                (DataType::Struct, Some(subscript)) => {
                    let struct_type = match datum.extra {
                        TypeExtra::Struct { struct_type } => struct_type,
                        _ => return Err(Error::Invalid("struct datum lacks its type")),
                    };
                    let index = registry.field_index(struct_type, &subscript_repr(subscript))?;
                    let decl = registry.lookup(struct_type)?;
                    let field_type = decl.fields[index].val_type;
                    if data_type != field_type {
                        return Err(Error::WrongType {
                            id,
                            expected: field_type,
                            found: data_type,
                        });
                    }
                    let value = codec::unpack(data_type, payload, &registry)?;
                    if datum.value.is_none() {
                        datum.value = Some(Value::Struct(registry.instantiate(struct_type)?));
                    }
                    let instance = match &mut datum.value {
                        Some(Value::Struct(s)) => s,
                        _ => return Err(Error::Invalid("struct datum holds a non-struct")),
                    };
                    if instance.fields[index].is_some() {
                        return Err(Error::DoubleWrite(id));
                    }
                    instance.fields[index] = Some(value);
                    FollowUp::None
                }
                (expected, None) => {
                    if data_type != expected {
                        return Err(Error::WrongType {
                            id,
                            expected,
                            found: data_type,
                        });
                    }
                    if datum.value.is_some() {
                        return Err(Error::DoubleWrite(id));
                    }
                    datum.value = Some(codec::unpack(data_type, payload, &registry)?);
                    tracing::debug!(%id, %data_type, "store");
                    FollowUp::None
                }
                (_, Some(_)) => {
                    return Err(Error::Invalid("subscript store on a non-container"));
                }
            }
        };

        let mut freed = false;
        if let FollowUp::Insert { subscript, val_type } = follow_up {
            freed = self.insert_notifications(id, subscript, val_type, payload, store_rc, notifs)?;
        }

        if !decr.is_none() {
            if freed {
                // The insert's own bookkeeping already collected the
                // datum; a further decrement would go negative.
                return Err(Error::RefcountNegative(id));
            }
            self.refcount_incr(id, decr.negate(), notifs)?;
        }
        Ok(())
    }

    /// Gather and clear the subscription state for a freshly inserted
    /// `(id, subscript)`. Returns whether the container was collected
    /// while releasing the subscription's read reference.
    fn insert_notifications(
        &mut self,
        id: DatumId,
        subscript: Box<[u8]>,
        val_type: DataType,
        payload: &[u8],
        store_rc: Refc,
        notifs: &mut Notifications,
    ) -> Result<bool> {
        let key = (id, subscript);
        let mut freed = false;

        let references = self.index_references.remove(&key).unwrap_or_default();
        if !references.is_empty() {
            if self.read_refcount_enabled {
                // Each resolved reference receives an independent live
                // ownership of whatever the inserted value references.
                let amount = store_rc.read.max(0) * references.len() as i64;
                if amount > 0 {
                    let value = codec::unpack(val_type, payload, &self.registry.clone())?;
                    let mut referands = Vec::new();
                    value.referands(&mut referands);
                    self.apply_referand_changes(&referands, Refc::new(amount, 0), notifs)?;
                }
                // The subscription set's single held read reference is
                // no longer needed.
                freed = self.refcount_impl(id, Refc::new(-1, 0), None, notifs)?;
            }
            notifs.references = references;
            notifs.value = Some((val_type, Bytes::copy_from_slice(payload)));
        }

        let listeners = self.index_listeners.remove(&key).unwrap_or_default();
        if !listeners.is_empty() {
            tracing::debug!(
                %id, subscript = %subscript_repr(&key.1), listeners = listeners.len(),
                "insert notification"
            );
            notifs.insert = Some((id, key.1, listeners));
        }
        Ok(freed)
    }

    /// Retrieve a value or a subscripted entry, applying `decr_self` to
    /// this datum and acquiring `incr_referand` on anything the
    /// retrieved portion references, as one atomic step.
    pub fn retrieve(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        decr_self: Refc,
        incr_referand: Refc,
        notifs: &mut Notifications,
    ) -> Result<(DataType, Bytes)> {
        let (data_type, packed, referands) = {
            let datum = self.datum(id)?;
            match subscript {
                None => {
                    let Some(value) = &datum.value else {
                        return Err(Error::Unset(id));
                    };
                    let mut referands = Vec::new();
                    value.referands(&mut referands);
                    (datum.data_type, codec::packed(value), referands)
                }
                Some(subscript) => match (&datum.value, datum.data_type) {
                    (Some(Value::Container(c)), _) => match c.members.get(subscript) {
                        None | Some(None) => {
                            return Err(Error::SubscriptNotFound {
                                id,
                                subscript: subscript_repr(subscript),
                            });
                        }
                        Some(Some(value)) => {
                            let mut referands = Vec::new();
                            value.referands(&mut referands);
                            (c.val_type, codec::packed(value), referands)
                        }
                    },
                    (Some(Value::Struct(s)), _) => {
                        let index = self
                            .registry
                            .field_index(s.struct_type, &subscript_repr(subscript))?;
                        let Some(value) = &s.fields[index] else {
                            return Err(Error::Unset(id));
                        };
                        let mut referands = Vec::new();
                        value.referands(&mut referands);
                        (value.data_type(), codec::packed(value), referands)
                    }
                    (None, _) => return Err(Error::Unset(id)),
                    _ => return Err(Error::Invalid("subscript lookup on a non-container")),
                },
            }
        };

        if !incr_referand.is_none() && !referands.is_empty() {
            // Prefer transferring references out of an about-to-die
            // datum over increment-then-decrement, which would race the
            // collection of the referands themselves.
            let scavenged = self.refcount_incr_scavenge(
                id,
                decr_self.negate(),
                Scavenge {
                    subscript,
                    refcounts: incr_referand,
                },
                notifs,
            )?;
            if !scavenged {
                self.apply_referand_changes(&referands, incr_referand, notifs)?;
                if !decr_self.is_none() {
                    self.refcount_incr(id, decr_self.negate(), notifs)?;
                }
            }
        } else if !decr_self.is_none() {
            self.refcount_incr(id, decr_self.negate(), notifs)?;
        }

        Ok((data_type, packed))
    }

    /// Subscribe `rank` to the close of `id`, or to the presence of a
    /// container subscript. Returns false when the event already
    /// happened and no notification will ever arrive.
    pub fn subscribe(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        rank: i32,
    ) -> Result<bool> {
        match subscript {
            None => {
                let datum = self.datums.get_mut(&id).ok_or(Error::NotFound(id))?;
                if datum.is_closed() {
                    return Ok(false);
                }
                datum.subscribe(rank);
                tracing::debug!(%id, rank, "subscribed to close");
                Ok(true)
            }
            Some(subscript) => {
                let datum = self.datum(id)?;
                let Some(Value::Container(c)) = &datum.value else {
                    return Err(Error::Invalid("subscript subscription on a non-container"));
                };
                if matches!(c.members.get(subscript), Some(Some(_))) {
                    // Already present: the caller reads it directly.
                    return Ok(false);
                }
                let ranks = self
                    .index_listeners
                    .entry((id, subscript.into()))
                    .or_default();
                if !ranks.contains(&rank) {
                    ranks.push(rank);
                }
                tracing::debug!(%id, subscript = %subscript_repr(subscript), rank, "subscribed to insert");
                Ok(true)
            }
        }
    }

    /// Register `reference` to be assigned the value of
    /// `(id, subscript)`. When the entry is already linked its packed
    /// value is returned instead and nothing is registered: the caller
    /// assigns the reference itself and releases its read reference.
    ///
    /// A fresh registration consumes one read reference on the
    /// container for the whole subscriber set; later registrations on
    /// the same subscript release their extra reference immediately.
    pub fn container_reference(
        &mut self,
        id: DatumId,
        subscript: &[u8],
        reference: DatumId,
        ref_type: DataType,
    ) -> Result<Option<(DataType, Bytes)>> {
        let (val_type, existing) = {
            let datum = self.datum(id)?;
            let Some(Value::Container(c)) = &datum.value else {
                return Err(Error::WrongType {
                    id,
                    expected: DataType::Container,
                    found: datum.data_type,
                });
            };
            if ref_type != c.val_type {
                return Err(Error::WrongType {
                    id,
                    expected: c.val_type,
                    found: ref_type,
                });
            }
            match c.members.get(subscript) {
                Some(Some(value)) => (c.val_type, Some(codec::packed(value))),
                _ => {
                    if datum.is_closed() {
                        return Err(Error::Invalid(
                            "subscript reference on a closed container that lacks the subscript",
                        ));
                    }
                    if datum.read_refcount <= 0 {
                        return Err(Error::Invalid(
                            "a container reference consumes a read reference",
                        ));
                    }
                    (c.val_type, None)
                }
            }
        };

        if let Some(packed) = existing {
            return Ok(Some((val_type, packed)));
        }

        let key = (id, Box::<[u8]>::from(subscript));
        match self.index_references.get_mut(&key) {
            Some(references) => {
                // The subscriber set already holds its one read
                // reference; release this caller's extra one. The set
                // guarantees at least two are held at this point.
                let datum = self.datums.get_mut(&id).expect("datum verified above");
                debug_assert!(datum.read_refcount >= 2);
                datum.read_refcount -= 1;
                tracing::debug!(%id, read_refcount = datum.read_refcount, "reused subscription reference");
                if !references.contains(&reference) {
                    references.push(reference);
                }
            }
            None => {
                self.index_references.insert(key, vec![reference]);
            }
        }
        Ok(None)
    }

    /// Reserve a container slot. See [`InsertAtomicResult`].
    pub fn insert_atomic(
        &mut self,
        id: DatumId,
        subscript: &[u8],
        return_value: bool,
    ) -> Result<InsertAtomicResult> {
        let datum = self.datums.get_mut(&id).ok_or(Error::NotFound(id))?;
        let Some(Value::Container(c)) = &mut datum.value else {
            return Err(Error::WrongType {
                id,
                expected: DataType::Container,
                found: datum.data_type,
            });
        };
        match c.members.get(subscript) {
            Some(Some(value)) => Ok(InsertAtomicResult {
                created: false,
                value_present: true,
                value: if return_value {
                    Some((c.val_type, codec::packed(value)))
                } else {
                    None
                },
            }),
            Some(None) => Ok(InsertAtomicResult {
                created: false,
                value_present: false,
                value: None,
            }),
            None => {
                c.members.insert(subscript.into(), None);
                tracing::debug!(%id, subscript = %subscript_repr(subscript), "reserved unlinked entry");
                Ok(InsertAtomicResult {
                    created: true,
                    value_present: false,
                    value: None,
                })
            }
        }
    }

    /// Stable linear slice over a container's or multiset's entries.
    /// A negative `count` means "to the end".
    pub fn enumerate(
        &mut self,
        id: DatumId,
        count: i64,
        offset: i64,
        include_keys: bool,
        include_vals: bool,
        decr: Refc,
        notifs: &mut Notifications,
    ) -> Result<EnumerateResult> {
        let offset = usize::try_from(offset).map_err(|_| Error::Invalid("negative offset"))?;

        let result = {
            let datum = self.datum(id)?;
            match &datum.value {
                Some(Value::Container(c)) => {
                    let mut writer = codec::SliceWriter::new(include_keys, include_vals);
                    for (key, value) in c
                        .members
                        .iter()
                        .filter_map(|(k, cell)| cell.as_ref().map(|v| (k, v)))
                        .skip(offset)
                        .take(slice_limit(count))
                    {
                        writer.push(key, Some(value));
                    }
                    EnumerateResult {
                        records: writer.entries(),
                        key_type: c.key_type,
                        val_type: c.val_type,
                        payload: writer.finish(),
                    }
                }
                Some(Value::Multiset(m)) => {
                    if include_keys {
                        return Err(Error::WrongType {
                            id,
                            expected: DataType::Container,
                            found: DataType::Multiset,
                        });
                    }
                    let mut writer = codec::SliceWriter::new(false, include_vals);
                    for elem in m.elems.iter().skip(offset).take(slice_limit(count)) {
                        writer.push(&[], Some(elem));
                    }
                    EnumerateResult {
                        records: writer.entries(),
                        key_type: DataType::Null,
                        val_type: m.elem_type,
                        payload: writer.finish(),
                    }
                }
                _ => {
                    return Err(Error::WrongType {
                        id,
                        expected: DataType::Container,
                        found: datum.data_type,
                    });
                }
            }
        };

        if !decr.is_none() {
            self.refcount_incr(id, decr.negate(), notifs)?;
        }
        Ok(result)
    }

    /// Entry count, reserved cells included.
    pub fn container_size(
        &mut self,
        id: DatumId,
        decr: Refc,
        notifs: &mut Notifications,
    ) -> Result<usize> {
        let size = {
            let datum = self.datum(id)?;
            match &datum.value {
                Some(Value::Container(c)) => c.members.len(),
                Some(Value::Multiset(m)) => m.elems.len(),
                _ => {
                    return Err(Error::WrongType {
                        id,
                        expected: DataType::Container,
                        found: datum.data_type,
                    });
                }
            }
        };
        if !decr.is_none() {
            self.refcount_incr(id, decr.negate(), notifs)?;
        }
        Ok(size)
    }

    /// Application-level per-id mutex. Returns whether the lock was
    /// acquired; a held lock asks the caller to retry.
    pub fn lock(&mut self, id: DatumId, rank: i32) -> Result<bool> {
        let () = self.datum(id).map(|_| ())?;
        use std::collections::hash_map::Entry;
        match self.locked.entry(id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(rank);
                Ok(true)
            }
        }
    }

    /// Release a lock. Unlock by a non-owner is not validated.
    pub fn unlock(&mut self, id: DatumId) -> Result<()> {
        self.locked
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::NotFound(id))
    }

    /// Datums still alive at shutdown, for the leak report.
    pub fn leaks(&self) -> impl Iterator<Item = (DatumId, &Datum)> {
        self.datums
            .iter()
            .filter(|(_, d)| !d.permanent)
            .map(|(id, d)| (*id, d))
    }
}

fn slice_limit(count: i64) -> usize {
    if count < 0 {
        usize::MAX
    } else {
        count as usize
    }
}
