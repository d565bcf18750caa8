//! Data-store operation stubs.

use crate::{check_dc, Client, Result};
use bytes::Bytes;
use codec::{DataType, DatumId, StructTypeId, TypeExtra, Value};
use proto::{Refc, Tag};

/// Result of an atomic container reserve.
#[derive(Debug)]
pub struct InsertOutcome {
    pub created: bool,
    pub value_present: bool,
    pub value: Option<(DataType, Bytes)>,
}

/// One enumerated slice of a container or multiset.
#[derive(Debug)]
pub struct EnumerateOutcome {
    pub records: usize,
    pub key_type: DataType,
    pub val_type: DataType,
    pub payload: Bytes,
}

/// Build a create spec with the given counts and defaults otherwise.
pub fn create_spec(
    id: DatumId,
    data_type: DataType,
    extra: TypeExtra,
    rc: Refc,
) -> proto::CreateSpec {
    let (key_type, val_type, struct_type) = match extra {
        TypeExtra::None => (0, 0, 0),
        TypeExtra::Container { key, val } => (key.code() as i32, val.code() as i32, 0),
        TypeExtra::Multiset { elem } => (0, elem.code() as i32, 0),
        TypeExtra::Struct { struct_type } => (0, 0, struct_type.0),
    };
    proto::CreateSpec {
        id: id.0,
        data_type: data_type.code() as i32,
        key_type,
        val_type,
        struct_type,
        read_refcount: rc.read,
        write_refcount: rc.write,
        permanent: false,
        release_write_refs: false,
        symbol: 0,
    }
}

impl Client {
    /// Declare a datum. A null id asks the home server to mint one.
    pub async fn create_with(&mut self, spec: proto::CreateSpec) -> Result<DatumId> {
        let to_server = if spec.id == 0 {
            self.home
        } else {
            self.owner(DatumId(spec.id))
        };
        self.endpoint.send_record(to_server, Tag::CreateHeader, &spec)?;
        let reply = self
            .endpoint()
            .recv_match(Some(to_server), &[Tag::Response])
            .await?;
        let resp: proto::CreateResponse = reply.decode("create response")?;
        check_dc(resp.dc)?;
        Ok(DatumId(resp.id))
    }

    pub async fn create(
        &mut self,
        id: DatumId,
        data_type: DataType,
        extra: TypeExtra,
        rc: Refc,
    ) -> Result<DatumId> {
        self.create_with(create_spec(id, data_type, extra, rc)).await
    }

    pub async fn create_integer(&mut self, id: DatumId, rc: Refc) -> Result<DatumId> {
        self.create(id, DataType::Integer, TypeExtra::None, rc).await
    }

    pub async fn create_float(&mut self, id: DatumId, rc: Refc) -> Result<DatumId> {
        self.create(id, DataType::Float, TypeExtra::None, rc).await
    }

    pub async fn create_string(&mut self, id: DatumId, rc: Refc) -> Result<DatumId> {
        self.create(id, DataType::String, TypeExtra::None, rc).await
    }

    pub async fn create_blob(&mut self, id: DatumId, rc: Refc) -> Result<DatumId> {
        self.create(id, DataType::Blob, TypeExtra::None, rc).await
    }

    pub async fn create_ref(&mut self, id: DatumId, rc: Refc) -> Result<DatumId> {
        self.create(id, DataType::Ref, TypeExtra::None, rc).await
    }

    pub async fn create_container(
        &mut self,
        id: DatumId,
        key: DataType,
        val: DataType,
        rc: Refc,
    ) -> Result<DatumId> {
        self.create(id, DataType::Container, TypeExtra::Container { key, val }, rc)
            .await
    }

    pub async fn create_multiset(
        &mut self,
        id: DatumId,
        elem: DataType,
        rc: Refc,
    ) -> Result<DatumId> {
        self.create(id, DataType::Multiset, TypeExtra::Multiset { elem }, rc)
            .await
    }

    pub async fn create_struct(
        &mut self,
        id: DatumId,
        struct_type: StructTypeId,
        rc: Refc,
    ) -> Result<DatumId> {
        self.create(id, DataType::Struct, TypeExtra::Struct { struct_type }, rc)
            .await
    }

    /// Create a batch of datums in one exchange with the home server,
    /// minting ids where the specs carry none.
    pub async fn multicreate(&mut self, specs: Vec<proto::CreateSpec>) -> Result<Vec<DatumId>> {
        let home = self.home;
        self.endpoint
            .send_record(home, Tag::Multicreate, &proto::MulticreateRequest { specs })?;
        let reply = self
            .endpoint()
            .recv_match(Some(home), &[Tag::Response])
            .await?;
        let resp: proto::MulticreateResponse = reply.decode("multicreate response")?;
        check_dc(resp.dc)?;
        Ok(resp.ids.into_iter().map(DatumId).collect())
    }

    /// Store a typed value (or container entry, or multiset element).
    pub async fn store(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        value: &Value,
        decr: Refc,
        store_rc: Refc,
    ) -> Result<()> {
        let payload = codec::packed(value);
        let frame = self
            .store_packed(id, subscript, value.data_type(), payload, decr, store_rc)
            .await?;
        if let Some(frame) = frame {
            self.apply_notifications(frame).await?;
        }
        Ok(())
    }

    /// Store pre-packed bytes, returning any attached notification
    /// frame unapplied.
    pub(crate) async fn store_packed(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        data_type: DataType,
        payload: Bytes,
        decr: Refc,
        store_rc: Refc,
    ) -> Result<Option<proto::NotificationFrame>> {
        let owner = self.owner(id);
        tracing::debug!(%id, ?subscript, %data_type, "store");

        self.endpoint.send_record(
            owner,
            Tag::StoreHeader,
            &proto::StoreHeader {
                id: id.0,
                data_type: data_type.code() as i32,
                subscript_len: subscript.map(|s| s.len() as i64).unwrap_or(0),
                refcount_decr: Some(decr),
                store_refcounts: Some(store_rc),
            },
        )?;
        if let Some(subscript) = subscript {
            self.endpoint
                .send(owner, Tag::StoreSubscript, Bytes::copy_from_slice(subscript))?;
        }
        self.endpoint.send(owner, Tag::StorePayload, payload)?;

        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::StoreResponse = reply.decode("store response")?;
        check_dc(resp.dc)?;

        match resp.notifs {
            Some(counts) if counts.total() > 0 => {
                let frame = self
                    .endpoint()
                    .recv_match(Some(owner), &[Tag::Notification])
                    .await?;
                Ok(Some(frame.decode("notification")?))
            }
            _ => Ok(None),
        }
    }

    /// Retrieve packed bytes, optionally consuming a read reference and
    /// acquiring references on anything the value points at.
    pub async fn retrieve(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        decr_self: Refc,
        incr_referand: Refc,
    ) -> Result<(DataType, Bytes)> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::Retrieve,
            &proto::RetrieveRequest {
                id: id.0,
                subscript: subscript.map(Bytes::copy_from_slice).unwrap_or_default(),
                decr_self: Some(decr_self),
                incr_referand: Some(incr_referand),
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::RetrieveResponse = reply.decode("retrieve response")?;
        check_dc(resp.dc)?;
        let data_type = DataType::from_code(resp.data_type as i64)?;

        self.apply_attached(owner, resp.notifs).await?;
        Ok((data_type, resp.payload))
    }

    /// Retrieve and unpack a typed value.
    pub async fn retrieve_value(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        decr_self: Refc,
    ) -> Result<Value> {
        let (data_type, payload) = self
            .retrieve(id, subscript, decr_self, Refc::NONE)
            .await?;
        let registry = self.registry().clone();
        Ok(codec::unpack(data_type, &payload, &registry)?)
    }

    /// Subscribe to a datum's close, or to the presence of a container
    /// subscript. Returns false when the event already happened.
    pub async fn subscribe(&mut self, id: DatumId, subscript: Option<&[u8]>) -> Result<bool> {
        let owner = self.owner(id);
        let rank = self.rank();
        self.endpoint.send_record(
            owner,
            Tag::Subscribe,
            &proto::SubscribeRequest {
                id: id.0,
                subscript: subscript.map(Bytes::copy_from_slice).unwrap_or_default(),
                subscriber: rank,
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::SubscribeResponse = reply.decode("subscribe response")?;
        check_dc(resp.dc)?;
        Ok(resp.subscribed)
    }

    /// Apply a read/write reference-count change.
    pub async fn refcount_incr(&mut self, id: DatumId, change: Refc) -> Result<()> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::RefcountIncr,
            &proto::RefcountIncrRequest {
                id: id.0,
                change: Some(change),
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::RefcountResponse = reply.decode("refcount response")?;
        check_dc(resp.dc)?;
        self.apply_attached(owner, resp.notifs).await
    }

    pub async fn exists(
        &mut self,
        id: DatumId,
        subscript: Option<&[u8]>,
        decr: Refc,
    ) -> Result<bool> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::Exists,
            &proto::ExistsRequest {
                id: id.0,
                subscript: subscript.map(Bytes::copy_from_slice).unwrap_or_default(),
                decr: Some(decr),
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::BoolResponse = reply.decode("exists response")?;
        check_dc(resp.dc)?;
        Ok(resp.result)
    }

    /// Enumerate a stable linear slice of a container or multiset.
    /// A negative count means "to the end".
    pub async fn enumerate(
        &mut self,
        id: DatumId,
        count: i64,
        offset: i64,
        request_subscripts: bool,
        request_members: bool,
        decr: Refc,
    ) -> Result<EnumerateOutcome> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::Enumerate,
            &proto::EnumerateRequest {
                id: id.0,
                count,
                offset,
                request_subscripts,
                request_members,
                decr: Some(decr),
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::EnumerateResponse = reply.decode("enumerate response")?;
        check_dc(resp.dc)?;
        Ok(EnumerateOutcome {
            records: resp.records as usize,
            key_type: DataType::from_code(resp.key_type as i64)?,
            val_type: DataType::from_code(resp.val_type as i64)?,
            payload: resp.payload,
        })
    }

    /// Reserve a container slot, optionally fetching an existing value.
    pub async fn insert_atomic(
        &mut self,
        id: DatumId,
        subscript: &[u8],
        return_value: bool,
    ) -> Result<InsertOutcome> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::InsertAtomic,
            &proto::InsertAtomicRequest {
                id: id.0,
                subscript: Bytes::copy_from_slice(subscript),
                return_value,
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::InsertAtomicResponse = reply.decode("insert atomic response")?;
        check_dc(resp.dc)?;
        let value = match resp.value {
            Some(bytes) => Some((DataType::from_code(resp.value_type as i64)?, bytes)),
            None => None,
        };
        Ok(InsertOutcome {
            created: resp.created,
            value_present: resp.value_present,
            value,
        })
    }

    /// Mint a fresh id from the home server's stride.
    pub async fn unique(&mut self) -> Result<DatumId> {
        let home = self.home;
        self.endpoint
            .send_record(home, Tag::Unique, &proto::IdRequest { id: 0 })?;
        let reply = self
            .endpoint()
            .recv_match(Some(home), &[Tag::Response])
            .await?;
        let resp: proto::UniqueResponse = reply.decode("unique response")?;
        check_dc(resp.dc)?;
        Ok(DatumId(resp.id))
    }

    pub async fn typeof_(&mut self, id: DatumId) -> Result<DataType> {
        let owner = self.owner(id);
        self.endpoint
            .send_record(owner, Tag::Typeof, &proto::IdRequest { id: id.0 })?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::TypeofResponse = reply.decode("typeof response")?;
        check_dc(resp.dc)?;
        Ok(DataType::from_code(resp.data_type as i64)?)
    }

    pub async fn container_typeof(&mut self, id: DatumId) -> Result<(DataType, DataType)> {
        let owner = self.owner(id);
        self.endpoint
            .send_record(owner, Tag::ContainerTypeof, &proto::IdRequest { id: id.0 })?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::ContainerTypeofResponse = reply.decode("container typeof response")?;
        check_dc(resp.dc)?;
        Ok((
            DataType::from_code(resp.key_type as i64)?,
            DataType::from_code(resp.val_type as i64)?,
        ))
    }

    /// Register `reference` to receive the value of `(id, subscript)`
    /// once present. The caller must hold a read reference on the
    /// container, which the subscription consumes.
    pub async fn container_reference(
        &mut self,
        id: DatumId,
        subscript: &[u8],
        reference: DatumId,
        ref_type: DataType,
    ) -> Result<()> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::ContainerReference,
            &proto::ContainerReferenceRequest {
                id: id.0,
                subscript: Bytes::copy_from_slice(subscript),
                reference: reference.0,
                ref_type: ref_type.code() as i32,
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::DataResponse = reply.decode("container reference response")?;
        check_dc(resp.dc)
    }

    pub async fn container_size(&mut self, id: DatumId, decr: Refc) -> Result<usize> {
        let owner = self.owner(id);
        self.endpoint.send_record(
            owner,
            Tag::ContainerSize,
            &proto::ContainerSizeRequest {
                id: id.0,
                decr: Some(decr),
            },
        )?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::SizeResponse = reply.decode("container size response")?;
        check_dc(resp.dc)?;
        Ok(resp.size as usize)
    }

    /// Try to take the application-level lock on `id`. False asks the
    /// caller to retry later.
    pub async fn lock(&mut self, id: DatumId) -> Result<bool> {
        let owner = self.owner(id);
        self.endpoint
            .send_record(owner, Tag::Lock, &proto::IdRequest { id: id.0 })?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::LockResponse = reply.decode("lock response")?;
        check_dc(resp.dc)?;
        Ok(resp.acquired)
    }

    pub async fn unlock(&mut self, id: DatumId) -> Result<()> {
        let owner = self.owner(id);
        self.endpoint
            .send_record(owner, Tag::Unlock, &proto::IdRequest { id: id.0 })?;
        let reply = self
            .endpoint()
            .recv_match(Some(owner), &[Tag::Response])
            .await?;
        let resp: proto::DataResponse = reply.decode("unlock response")?;
        check_dc(resp.dc)
    }
}

