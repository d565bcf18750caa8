use crate::{
    notification_payload, parse_notification, Counters, Error, NewWork, RequestQueue, Result,
    RuleEngine, Settings, WorkQueue, WorkUnit, CONTROL_PRIORITY, CONTROL_WORK_TYPE,
    PENDING_SYNC_MAX,
};
use bytes::Bytes;
use codec::{DataType, DatumId, StructRegistry, TypeExtra};
use fabric::{Endpoint, Envelope, Rank, Topology};
use proto::{Code, DataCode, Refc, Tag};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{CreateProps, Notifications, Store};

/// Notification work held for routing by the main loop, after the
/// reply that produced it has gone out and outside any sync.
enum Routed {
    Notifs(Notifications),
    Frame(proto::NotificationFrame),
}

/// Outcome of an outbound sync attempt.
#[derive(Debug, PartialEq, Eq)]
enum SyncOutcome {
    Accepted,
    Rejected,
}

/// One server process: the event loop over its mailbox, servicing
/// worker requests, peer syncs, steals, and idle checks.
pub struct Server {
    endpoint: Endpoint,
    topology: Topology,
    rank: Rank,
    settings: Settings,
    work_types: usize,
    store: Store,
    workqueue: WorkQueue,
    requests: RequestQueue,
    rules: RuleEngine,
    counters: Counters,

    /// Inbound syncs from lower-ranked servers deferred while this
    /// server's own sync is outstanding.
    pending_syncs: VecDeque<(Rank, proto::SyncRequest)>,
    sync_in_progress: bool,
    /// Notification work awaiting routing by the main loop.
    deferred: VecDeque<Routed>,

    shutting_down: bool,
    fail_code: Option<i32>,
    idle_attempt: i64,

    steal_failures: u32,
    steal_retry_at: Option<Instant>,
    next_steal_peer: usize,
}

impl Server {
    pub fn new(
        endpoint: Endpoint,
        work_types: usize,
        settings: Settings,
        registry: Arc<StructRegistry>,
    ) -> Self {
        let topology = endpoint.topology();
        let rank = endpoint.rank();
        assert!(topology.is_server(rank), "rank {rank} is not a server");

        let store = Store::new(
            topology.servers,
            topology.server_index(rank),
            settings.read_refcount,
            registry,
        );
        let counters = Counters::new(settings.perf_counters);
        Self {
            endpoint,
            topology,
            rank,
            work_types,
            store,
            workqueue: WorkQueue::new(),
            requests: RequestQueue::new(),
            rules: RuleEngine::new(),
            counters,
            pending_syncs: VecDeque::new(),
            sync_in_progress: false,
            deferred: VecDeque::new(),
            shutting_down: false,
            fail_code: None,
            idle_attempt: 0,
            steal_failures: 0,
            steal_retry_at: None,
            next_steal_peer: 0,
            settings,
        }
    }

    fn is_master(&self) -> bool {
        self.rank == self.topology.master_server()
    }

    /// Workers assigned to this server by rank-modulo affinity.
    fn my_worker_count(&self) -> usize {
        self.topology
            .worker_ranks()
            .filter(|r| self.topology.home_server(*r) == self.rank)
            .count()
    }

    fn reply<M: prost::Message>(&self, to: Rank, tag: Tag, record: &M) -> Result<()> {
        self.endpoint.send_record(to, tag, record)?;
        Ok(())
    }

    /// Run the event loop until shutdown, returning the exit code.
    pub async fn serve(mut self) -> Result<i32> {
        if self.settings.debug_ranks {
            tracing::info!(
                rank = self.rank,
                workers = self.topology.workers,
                servers = self.topology.servers,
                master = self.is_master(),
                "server starting"
            );
        }
        match self.run().await {
            Ok(()) | Err(Error::Shutdown) => Ok(self.finalize()),
            Err(err) => Err(err),
        }
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            self.drain_background().await?;
            if self.shutting_down {
                return Ok(());
            }

            match self.poll().await? {
                Some(envelope) => self.dispatch(envelope).await?,
                None => {
                    if self.steal_due() {
                        self.try_steal().await?;
                    }
                    if self.is_master() {
                        self.master_idle_check().await?;
                    }
                }
            }
            self.release_parallel()?;
            if self.steal_due() {
                self.try_steal().await?;
            }
        }
    }

    /// Service deferred syncs and routed notification work accumulated
    /// by handlers. Both may enqueue more of each other; drain to a
    /// fixed point.
    async fn drain_background(&mut self) -> Result<()> {
        loop {
            if let Some((peer, request)) = self.pending_syncs.pop_front() {
                self.accept_sync(peer, request).await?;
                continue;
            }
            if let Some(routed) = self.deferred.pop_front() {
                match routed {
                    Routed::Notifs(notifs) => self.route_notifications(notifs).await?,
                    Routed::Frame(frame) => self.apply_frame(frame).await?,
                }
                continue;
            }
            return Ok(());
        }
    }

    /// One bounded probe: the next envelope, or `None` on an idle tick.
    async fn poll(&mut self) -> Result<Option<Envelope>> {
        let mut wait: Option<Duration> = None;
        if self.is_master() {
            wait = Some(self.settings.idle_check_interval);
        }
        if let Some(at) = self.steal_retry_at {
            let remaining = at.saturating_duration_since(Instant::now());
            wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
        }

        match wait {
            None => Ok(Some(self.endpoint.recv().await?)),
            Some(wait) => match tokio::time::timeout(wait, self.endpoint.recv()).await {
                Ok(envelope) => Ok(Some(envelope?)),
                Err(_elapsed) => Ok(None),
            },
        }
    }

    fn finalize(&mut self) -> i32 {
        // Release every parked worker with a shutdown reply, and wave
        // off the rest.
        for (rank, _work_type) in self.requests.drain() {
            let resp = proto::GetResponse {
                code: Code::Shutdown as i32,
                ..Default::default()
            };
            let _ = self.endpoint.send_record(rank, Tag::ResponseGet, &resp);
        }
        for rank in self.topology.worker_ranks() {
            if self.topology.home_server(rank) == self.rank {
                let _ = self.endpoint.send(rank, Tag::ShutdownWorker, Bytes::new());
            }
        }

        if self.settings.report_leaks {
            for (id, datum) in self.store.leaks() {
                if datum.is_set() {
                    tracing::warn!(
                        %id,
                        data_type = %datum.data_type,
                        r = datum.read_refcount,
                        w = datum.write_refcount,
                        "leaked datum"
                    );
                } else {
                    tracing::warn!(%id, "unset variable at shutdown");
                }
            }
        }
        self.counters.report();
        tracing::debug!(rank = self.rank, "server stopped");
        self.fail_code.unwrap_or(0)
    }

    // ---- Dispatch ----

    /// Classify and handle one envelope. Boxed because serving an
    /// accepted sync re-enters dispatch.
    fn dispatch<'s>(
        &'s mut self,
        env: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 's>> {
        Box::pin(async move {
            tracing::trace!(rank = self.rank, from = env.from, tag = %env.tag, "dispatch");
            match env.tag {
                Tag::Put => self.handle_put(env).await,
                Tag::PutRule => self.handle_put_rule(env).await,
                Tag::Get => self.handle_get(env, true),
                Tag::Iget => self.handle_get(env, false),
                Tag::CreateHeader => self.handle_create(env),
                Tag::Multicreate => self.handle_multicreate(env),
                Tag::Exists => self.handle_exists(env),
                Tag::StoreHeader => self.handle_store(env).await,
                Tag::Retrieve => self.handle_retrieve(env),
                Tag::Enumerate => self.handle_enumerate(env),
                Tag::Subscribe => self.handle_subscribe(env),
                Tag::RefcountIncr => self.handle_refcount_incr(env),
                Tag::InsertAtomic => self.handle_insert_atomic(env),
                Tag::Unique => self.handle_unique(env),
                Tag::Typeof => self.handle_typeof(env),
                Tag::ContainerTypeof => self.handle_container_typeof(env),
                Tag::ContainerReference => self.handle_container_reference(env),
                Tag::ContainerSize => self.handle_container_size(env),
                Tag::Lock => self.handle_lock(env),
                Tag::Unlock => self.handle_unlock(env),
                Tag::SyncRequest => {
                    let request: proto::SyncRequest = env.decode("sync request")?;
                    self.accept_sync(env.from, request).await
                }
                Tag::CheckIdle => self.handle_check_idle(env),
                Tag::ShutdownServer => {
                    tracing::debug!(rank = self.rank, "shutdown received");
                    self.shutting_down = true;
                    Ok(())
                }
                Tag::Fail => self.handle_fail(env),
                other => {
                    tracing::warn!(from = env.from, tag = %other, "unexpected message");
                    Ok(())
                }
            }
        })
    }

    // ---- Task operations ----

    async fn handle_put(&mut self, env: Envelope) -> Result<()> {
        let req: proto::PutRequest = env.decode("put")?;
        let putter = env.from;

        // Control tasks addressed to this server feed the rule engine.
        if req.target == self.rank {
            let Some(payload) = req.inline_payload.clone() else {
                return self.reject_put(putter, "rule notifications must ride inline");
            };
            self.reply(
                putter,
                Tag::ResponsePut,
                &proto::PutResponse {
                    code: Code::Success as i32,
                    payload_dest: proto::RANK_NULL,
                },
            )?;
            let (id, subscript) = parse_notification(&payload)?;
            return self.rule_closed(id, subscript.as_deref());
        }

        if req.parallelism < 1
            || (req.target != proto::RANK_ANY && !self.topology.is_worker(req.target))
        {
            return self.reject_put(putter, "invalid target or parallelism");
        }

        // A non-inline payload for a task we can dispatch right now is
        // redirected: the putter ships it straight to the worker.
        if req.inline_payload.is_none() && req.parallelism == 1 {
            let matched = if req.target != proto::RANK_ANY {
                self.requests
                    .match_target(req.target, req.work_type)
                    .then_some(req.target)
            } else {
                self.requests.match_type(req.work_type)
            };
            if let Some(worker) = matched {
                tracing::debug!(worker, putter, "redirecting put payload");
                self.reply(
                    worker,
                    Tag::ResponseGet,
                    &proto::GetResponse {
                        code: Code::Success as i32,
                        payload_len: req.payload_len,
                        answer: req.answer,
                        work_type: req.work_type,
                        payload_source: putter,
                        parallelism: 1,
                    },
                )?;
                self.reply(
                    putter,
                    Tag::ResponsePut,
                    &proto::PutResponse {
                        code: Code::Success as i32,
                        payload_dest: worker,
                    },
                )?;
                self.counters.dispatched(req.work_type);
                return Ok(());
            }
        }

        // Otherwise the server takes custody of the payload.
        let payload = match req.inline_payload {
            Some(ref bytes) => {
                self.reply(
                    putter,
                    Tag::ResponsePut,
                    &proto::PutResponse {
                        code: Code::Success as i32,
                        payload_dest: proto::RANK_NULL,
                    },
                )?;
                bytes.clone()
            }
            None => {
                self.reply(
                    putter,
                    Tag::ResponsePut,
                    &proto::PutResponse {
                        code: Code::Success as i32,
                        payload_dest: self.rank,
                    },
                )?;
                self.endpoint
                    .recv_match(Some(putter), &[Tag::Work])
                    .await?
                    .payload
            }
        };

        self.offer(NewWork {
            work_type: req.work_type,
            priority: req.priority,
            putter,
            answer: req.answer,
            target: req.target,
            parallelism: req.parallelism,
            payload,
        })
    }

    fn reject_put(&mut self, putter: Rank, reason: &'static str) -> Result<()> {
        tracing::warn!(putter, reason, "rejecting put");
        self.reply(
            putter,
            Tag::ResponsePut,
            &proto::PutResponse {
                code: Code::Error as i32,
                payload_dest: proto::RANK_NULL,
            },
        )
    }

    async fn handle_put_rule(&mut self, env: Envelope) -> Result<()> {
        let req: proto::PutRuleRequest = env.decode("put rule")?;
        let putter = env.from;
        let put = req.put.unwrap_or_default();

        let payload = match put.inline_payload {
            Some(ref bytes) => {
                self.reply(
                    putter,
                    Tag::ResponsePut,
                    &proto::PutResponse {
                        code: Code::Success as i32,
                        payload_dest: proto::RANK_NULL,
                    },
                )?;
                bytes.clone()
            }
            None => {
                self.reply(
                    putter,
                    Tag::ResponsePut,
                    &proto::PutResponse {
                        code: Code::Success as i32,
                        payload_dest: self.rank,
                    },
                )?;
                self.endpoint
                    .recv_match(Some(putter), &[Tag::Work])
                    .await?
                    .payload
            }
        };

        // Subscribe to each waited id; already-closed ids do not count
        // toward the rule's remaining total.
        let mut keys = Vec::new();
        let mut remaining = 0;
        for id in req.wait_ids {
            if self.subscribe_for_rule(DatumId(id), None).await? {
                remaining += 1;
            }
            keys.push((DatumId(id), None));
        }
        for pair in req.wait_id_subs {
            let subscript: Box<[u8]> = pair.subscript.as_ref().into();
            if self
                .subscribe_for_rule(DatumId(pair.id), Some(&subscript))
                .await?
            {
                remaining += 1;
            }
            keys.push((DatumId(pair.id), Some(subscript)));
        }

        let work = NewWork {
            work_type: put.work_type,
            priority: put.priority,
            putter,
            answer: put.answer,
            target: put.target,
            parallelism: put.parallelism,
            payload,
        };
        if let Some(ready) = self.rules.add(work, keys, remaining) {
            self.offer(ready)?;
        }
        Ok(())
    }

    /// Subscribe this server to the close of a waited id. Local ids go
    /// straight to the store; remote ones ride a sync.
    async fn subscribe_for_rule(&mut self, id: DatumId, subscript: Option<&[u8]>) -> Result<bool> {
        let owner = self.topology.shard_owner(id.0);
        if owner == self.rank {
            return match self.store.subscribe(id, subscript, self.rank) {
                Ok(subscribed) => Ok(subscribed),
                Err(err) => {
                    tracing::warn!(%id, %err, "put-rule subscription failed");
                    Ok(false)
                }
            };
        }

        if self.sync_to(owner, request_sync(), true).await? != SyncOutcome::Accepted {
            return Err(Error::Shutdown);
        }
        self.endpoint.send_record(
            owner,
            Tag::Subscribe,
            &proto::SubscribeRequest {
                id: id.0,
                subscript: subscript.map(Bytes::copy_from_slice).unwrap_or_default(),
                subscriber: self.rank,
            },
        )?;
        let reply = self.await_reply(owner, &[Tag::Response]).await?;
        let resp: proto::SubscribeResponse = reply.decode("subscribe response")?;
        Ok(resp.dc == DataCode::Ok as i32 && resp.subscribed)
    }

    /// A close notification addressed to this server: advance the rule
    /// engine and enqueue any tasks that became ready.
    fn rule_closed(&mut self, id: DatumId, subscript: Option<&[u8]>) -> Result<()> {
        for work in self.rules.close(id, subscript) {
            self.offer(work)?;
        }
        Ok(())
    }

    fn handle_get(&mut self, env: Envelope, blocking: bool) -> Result<()> {
        let req: proto::GetRequest = env.decode("get")?;
        let rank = env.from;

        if self.shutting_down {
            return self.reply(
                rank,
                Tag::ResponseGet,
                &proto::GetResponse {
                    code: Code::Shutdown as i32,
                    ..Default::default()
                },
            );
        }

        if let Some(unit) = self.workqueue.get(rank, req.work_type) {
            self.counters.dispatched(unit.work_type);
            return self.send_unit(rank, &unit);
        }
        if blocking {
            self.requests.add(rank, req.work_type);
            Ok(())
        } else {
            self.reply(
                rank,
                Tag::ResponseGet,
                &proto::GetResponse {
                    code: Code::Nothing as i32,
                    ..Default::default()
                },
            )
        }
    }

    /// Ship a single task to a worker: the get response, then the
    /// payload frame.
    fn send_unit(&mut self, rank: Rank, unit: &WorkUnit) -> Result<()> {
        self.reply(
            rank,
            Tag::ResponseGet,
            &proto::GetResponse {
                code: Code::Success as i32,
                payload_len: unit.payload.len() as i64,
                answer: unit.answer,
                work_type: unit.work_type,
                payload_source: self.rank,
                parallelism: 1,
            },
        )?;
        self.endpoint.send(rank, Tag::Work, unit.payload.clone())?;
        Ok(())
    }

    /// Enqueue new work, dispatching immediately when a parked request
    /// matches.
    fn offer(&mut self, work: NewWork) -> Result<()> {
        let work_type = work.work_type;
        let target = work.target;
        let parallelism = work.parallelism;
        self.counters.enqueued(work_type);
        self.workqueue.add(work);

        if parallelism == 1 {
            let matched = if target != proto::RANK_ANY {
                self.requests
                    .match_target(target, work_type)
                    .then_some(target)
            } else {
                self.requests.match_type(work_type)
            };
            if let Some(rank) = matched {
                match self.workqueue.get(rank, work_type) {
                    Some(unit) => {
                        self.counters.dispatched(work_type);
                        self.send_unit(rank, &unit)?;
                    }
                    None => self.requests.add(rank, work_type),
                }
            }
        }
        Ok(())
    }

    /// Release parallel tasks whose gang can be fully reserved. The
    /// reservation is all-or-nothing; a partial gang stays parked.
    fn release_parallel(&mut self) -> Result<()> {
        for (id, work_type, parallelism) in self.workqueue.parallel_candidates() {
            let Ok(count) = usize::try_from(parallelism) else {
                continue;
            };
            let Some(ranks) = self.requests.parallel_reserve(work_type, count) else {
                continue;
            };
            let unit = self.workqueue.take(id).expect("candidate is pooled");
            tracing::debug!(?ranks, work_type, "releasing parallel gang");
            self.counters.dispatched(work_type);

            let gang = proto::GangRanks {
                ranks: ranks.clone(),
            };
            for &rank in &ranks {
                self.reply(
                    rank,
                    Tag::ResponseGet,
                    &proto::GetResponse {
                        code: Code::Success as i32,
                        payload_len: unit.payload.len() as i64,
                        answer: unit.answer,
                        work_type: unit.work_type,
                        payload_source: self.rank,
                        parallelism: unit.parallelism,
                    },
                )?;
                self.endpoint.send(rank, Tag::Work, unit.payload.clone())?;
                self.reply(rank, Tag::ResponseGet, &gang)?;
            }
        }
        Ok(())
    }

    // ---- Data operations ----

    fn handle_create(&mut self, env: Envelope) -> Result<()> {
        let spec: proto::CreateSpec = env.decode("create")?;
        let resp = match self.create_impl(&spec) {
            Ok(id) => proto::CreateResponse {
                dc: DataCode::Ok as i32,
                id: id.0,
            },
            Err(err) => {
                tracing::debug!(id = spec.id, %err, "create failed");
                proto::CreateResponse {
                    dc: err.code() as i32,
                    id: 0,
                }
            }
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn create_impl(&mut self, spec: &proto::CreateSpec) -> store::Result<DatumId> {
        let data_type = DataType::from_code(spec.data_type as i64)?;
        let extra = match data_type {
            DataType::Container => TypeExtra::Container {
                key: DataType::from_code(spec.key_type as i64)?,
                val: DataType::from_code(spec.val_type as i64)?,
            },
            DataType::Multiset => TypeExtra::Multiset {
                elem: DataType::from_code(spec.val_type as i64)?,
            },
            DataType::Struct => TypeExtra::Struct {
                struct_type: codec::StructTypeId(spec.struct_type),
            },
            _ => TypeExtra::None,
        };
        let props = CreateProps {
            read_refcount: spec.read_refcount,
            write_refcount: spec.write_refcount,
            permanent: spec.permanent,
            release_write_refs: spec.release_write_refs,
            symbol: spec.symbol,
        };
        self.store.create(DatumId(spec.id), data_type, extra, &props)
    }

    fn handle_multicreate(&mut self, env: Envelope) -> Result<()> {
        let req: proto::MulticreateRequest = env.decode("multicreate")?;
        let mut ids = Vec::with_capacity(req.specs.len());
        let mut dc = DataCode::Ok;
        for spec in &req.specs {
            match self.create_impl(spec) {
                Ok(id) => ids.push(id.0),
                Err(err) => {
                    tracing::debug!(%err, "multicreate entry failed");
                    dc = err.code();
                    ids.push(0);
                }
            }
        }
        self.reply(
            env.from,
            Tag::Response,
            &proto::MulticreateResponse {
                dc: dc as i32,
                ids,
            },
        )
    }

    fn handle_exists(&mut self, env: Envelope) -> Result<()> {
        let req: proto::ExistsRequest = env.decode("exists")?;
        let id = DatumId(req.id);

        let mut result = self.store.exists(id, subscript_of(&req.subscript));
        if result.is_ok() {
            let decr = req.decr.unwrap_or_default();
            if !decr.is_none() {
                let mut notifs = Notifications::new();
                if let Err(err) = self.store.refcount_incr(id, decr.negate(), &mut notifs) {
                    result = Err(err);
                }
                self.defer(notifs);
            }
        }

        let resp = match result {
            Ok(found) => proto::BoolResponse {
                dc: DataCode::Ok as i32,
                result: found,
            },
            Err(err) => proto::BoolResponse {
                dc: err.code() as i32,
                result: false,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    async fn handle_store(&mut self, env: Envelope) -> Result<()> {
        let hdr: proto::StoreHeader = env.decode("store header")?;
        let from = env.from;

        // The subscript and payload arrive as their own frames.
        let subscript = if hdr.subscript_len > 0 {
            Some(
                self.endpoint
                    .recv_match(Some(from), &[Tag::StoreSubscript])
                    .await?
                    .payload,
            )
        } else {
            None
        };
        let payload = self
            .endpoint
            .recv_match(Some(from), &[Tag::StorePayload])
            .await?
            .payload;

        let id = DatumId(hdr.id);
        let mut notifs = Notifications::new();
        let result = DataType::from_code(hdr.data_type as i64)
            .map_err(store::Error::from)
            .and_then(|data_type| {
                self.store.store(
                    id,
                    subscript.as_deref(),
                    data_type,
                    &payload,
                    hdr.refcount_decr.unwrap_or_default(),
                    hdr.store_refcounts.unwrap_or_default(),
                    &mut notifs,
                )
            });

        match result {
            Ok(()) => {
                let frame = self.client_frame(id, subscript.as_deref(), &mut notifs);
                self.reply(
                    from,
                    Tag::Response,
                    &proto::StoreResponse {
                        dc: DataCode::Ok as i32,
                        notifs: Some(frame.counts()),
                    },
                )?;
                if !frame.is_empty() {
                    self.reply(from, Tag::Notification, &frame)?;
                }
                self.defer(notifs);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%id, %err, "store failed");
                self.reply(
                    from,
                    Tag::Response,
                    &proto::StoreResponse {
                        dc: err.code() as i32,
                        notifs: None,
                    },
                )
            }
        }
    }

    fn handle_retrieve(&mut self, env: Envelope) -> Result<()> {
        let req: proto::RetrieveRequest = env.decode("retrieve")?;
        let id = DatumId(req.id);
        let subscript = subscript_of(&req.subscript);
        let mut notifs = Notifications::new();

        let result = self.store.retrieve(
            id,
            subscript,
            req.decr_self.unwrap_or_default(),
            req.incr_referand.unwrap_or_default(),
            &mut notifs,
        );
        match result {
            Ok((data_type, payload)) => {
                let frame = self.client_frame(id, subscript, &mut notifs);
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::RetrieveResponse {
                        dc: DataCode::Ok as i32,
                        data_type: data_type.code() as i32,
                        payload,
                        notifs: Some(frame.counts()),
                    },
                )?;
                if !frame.is_empty() {
                    self.reply(env.from, Tag::Notification, &frame)?;
                }
                self.defer(notifs);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%id, %err, "retrieve failed");
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::RetrieveResponse {
                        dc: err.code() as i32,
                        ..Default::default()
                    },
                )
            }
        }
    }

    fn handle_enumerate(&mut self, env: Envelope) -> Result<()> {
        let req: proto::EnumerateRequest = env.decode("enumerate")?;
        let mut notifs = Notifications::new();
        let result = self.store.enumerate(
            DatumId(req.id),
            req.count,
            req.offset,
            req.request_subscripts,
            req.request_members,
            req.decr.unwrap_or_default(),
            &mut notifs,
        );
        let resp = match result {
            Ok(slice) => proto::EnumerateResponse {
                dc: DataCode::Ok as i32,
                records: slice.records as i64,
                key_type: slice.key_type.code() as i32,
                val_type: slice.val_type.code() as i32,
                payload: Bytes::from(slice.payload),
            },
            Err(err) => proto::EnumerateResponse {
                dc: err.code() as i32,
                ..Default::default()
            },
        };
        self.defer(notifs);
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_subscribe(&mut self, env: Envelope) -> Result<()> {
        let req: proto::SubscribeRequest = env.decode("subscribe")?;
        let subscriber = if req.subscriber != 0 {
            req.subscriber
        } else {
            env.from
        };
        let resp = match self
            .store
            .subscribe(DatumId(req.id), subscript_of(&req.subscript), subscriber)
        {
            Ok(subscribed) => proto::SubscribeResponse {
                dc: DataCode::Ok as i32,
                subscribed,
            },
            Err(err) => proto::SubscribeResponse {
                dc: err.code() as i32,
                subscribed: false,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_refcount_incr(&mut self, env: Envelope) -> Result<()> {
        let req: proto::RefcountIncrRequest = env.decode("refcount incr")?;
        let id = DatumId(req.id);
        let mut notifs = Notifications::new();
        match self
            .store
            .refcount_incr(id, req.change.unwrap_or_default(), &mut notifs)
        {
            Ok(()) => {
                let frame = self.client_frame(id, None, &mut notifs);
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::RefcountResponse {
                        dc: DataCode::Ok as i32,
                        notifs: Some(frame.counts()),
                    },
                )?;
                if !frame.is_empty() {
                    self.reply(env.from, Tag::Notification, &frame)?;
                }
                self.defer(notifs);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%id, %err, "refcount change failed");
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::RefcountResponse {
                        dc: err.code() as i32,
                        notifs: None,
                    },
                )
            }
        }
    }

    fn handle_insert_atomic(&mut self, env: Envelope) -> Result<()> {
        let req: proto::InsertAtomicRequest = env.decode("insert atomic")?;
        let resp = match self
            .store
            .insert_atomic(DatumId(req.id), &req.subscript, req.return_value)
        {
            Ok(result) => {
                let (value_type, value) = match result.value {
                    Some((ty, bytes)) => (ty.code() as i32, Some(bytes)),
                    None => (DataType::Null.code() as i32, None),
                };
                proto::InsertAtomicResponse {
                    dc: DataCode::Ok as i32,
                    created: result.created,
                    value_present: result.value_present,
                    value_type,
                    value,
                }
            }
            Err(err) => proto::InsertAtomicResponse {
                dc: err.code() as i32,
                ..Default::default()
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_unique(&mut self, env: Envelope) -> Result<()> {
        let resp = match self.store.unique() {
            Ok(id) => proto::UniqueResponse {
                dc: DataCode::Ok as i32,
                id: id.0,
            },
            Err(err) => proto::UniqueResponse {
                dc: err.code() as i32,
                id: 0,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_typeof(&mut self, env: Envelope) -> Result<()> {
        let req: proto::IdRequest = env.decode("typeof")?;
        let resp = match self.store.typeof_(DatumId(req.id)) {
            Ok(data_type) => proto::TypeofResponse {
                dc: DataCode::Ok as i32,
                data_type: data_type.code() as i32,
            },
            Err(err) => proto::TypeofResponse {
                dc: err.code() as i32,
                data_type: DataType::Null.code() as i32,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_container_typeof(&mut self, env: Envelope) -> Result<()> {
        let req: proto::IdRequest = env.decode("container typeof")?;
        let resp = match self.store.container_typeof(DatumId(req.id)) {
            Ok((key, val)) => proto::ContainerTypeofResponse {
                dc: DataCode::Ok as i32,
                key_type: key.code() as i32,
                val_type: val.code() as i32,
            },
            Err(err) => proto::ContainerTypeofResponse {
                dc: err.code() as i32,
                ..Default::default()
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_container_reference(&mut self, env: Envelope) -> Result<()> {
        let req: proto::ContainerReferenceRequest = env.decode("container reference")?;
        let id = DatumId(req.id);
        let result = DataType::from_code(req.ref_type as i64)
            .map_err(store::Error::from)
            .and_then(|ref_type| {
                self.store
                    .container_reference(id, &req.subscript, DatumId(req.reference), ref_type)
            });

        match result {
            Ok(None) => self.reply(
                env.from,
                Tag::Response,
                &proto::DataResponse {
                    dc: DataCode::Ok as i32,
                },
            ),
            Ok(Some((data_type, value))) => {
                // The value is already present: assign the reference
                // and release the read reference this call consumed.
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::DataResponse {
                        dc: DataCode::Ok as i32,
                    },
                )?;
                let mut notifs = Notifications::new();
                notifs.references = vec![DatumId(req.reference)];
                notifs.value = Some((data_type, value));
                if let Err(err) = self.store.refcount_incr(id, Refc::new(-1, 0), &mut notifs) {
                    tracing::warn!(%id, %err, "reference release failed");
                }
                self.defer(notifs);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%id, %err, "container reference failed");
                self.reply(
                    env.from,
                    Tag::Response,
                    &proto::DataResponse {
                        dc: err.code() as i32,
                    },
                )
            }
        }
    }

    fn handle_container_size(&mut self, env: Envelope) -> Result<()> {
        let req: proto::ContainerSizeRequest = env.decode("container size")?;
        let mut notifs = Notifications::new();
        let resp = match self.store.container_size(
            DatumId(req.id),
            req.decr.unwrap_or_default(),
            &mut notifs,
        ) {
            Ok(size) => proto::SizeResponse {
                dc: DataCode::Ok as i32,
                size: size as i64,
            },
            Err(err) => proto::SizeResponse {
                dc: err.code() as i32,
                size: -1,
            },
        };
        self.defer(notifs);
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_lock(&mut self, env: Envelope) -> Result<()> {
        let req: proto::IdRequest = env.decode("lock")?;
        let resp = match self.store.lock(DatumId(req.id), env.from) {
            Ok(acquired) => proto::LockResponse {
                dc: DataCode::Ok as i32,
                acquired,
            },
            Err(err) => proto::LockResponse {
                dc: err.code() as i32,
                acquired: false,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_unlock(&mut self, env: Envelope) -> Result<()> {
        let req: proto::IdRequest = env.decode("unlock")?;
        let resp = match self.store.unlock(DatumId(req.id)) {
            Ok(()) => proto::DataResponse {
                dc: DataCode::Ok as i32,
            },
            Err(err) => proto::DataResponse {
                dc: err.code() as i32,
            },
        };
        self.reply(env.from, Tag::Response, &resp)
    }

    fn handle_fail(&mut self, env: Envelope) -> Result<()> {
        let notice: proto::FailNotice = env.decode("fail")?;
        tracing::error!(from = env.from, code = notice.code, "failure reported");
        self.fail_code = Some(notice.code);
        if self.is_master() {
            // Propagate the fault code to every server before stopping.
            for peer in self.topology.server_ranks() {
                if peer != self.rank {
                    self.reply(peer, Tag::Fail, &notice)?;
                }
            }
        } else if self.topology.is_worker(env.from) {
            // A worker reported here instead of to the master; relay.
            self.reply(self.topology.master_server(), Tag::Fail, &notice)?;
        }
        self.shutting_down = true;
        Ok(())
    }

    // ---- Notification routing ----

    /// Split out the portion of `notifs` the requesting client applies:
    /// closes of the operation's own datum, insert listeners, and
    /// pending references with the inserted value.
    fn client_frame(
        &self,
        id: DatumId,
        subscript: Option<&[u8]>,
        notifs: &mut Notifications,
    ) -> proto::NotificationFrame {
        let close_notify = notifs.take_closes_of(id);
        let insert_notify = match notifs.insert.take() {
            Some((_, _, ranks)) => ranks,
            None => Vec::new(),
        };
        let references: Vec<i64> = std::mem::take(&mut notifs.references)
            .into_iter()
            .map(|r| r.0)
            .collect();
        let (value_type, value) = match notifs.value.take() {
            Some((ty, bytes)) => (ty.code() as i32, bytes),
            None => (DataType::Null.code() as i32, Bytes::new()),
        };
        proto::NotificationFrame {
            id: id.0,
            subscript: subscript.map(Bytes::copy_from_slice).unwrap_or_default(),
            close_notify,
            insert_notify,
            references,
            value_type,
            value,
        }
    }

    /// Queue server-side notification work for the main loop.
    fn defer(&mut self, notifs: Notifications) {
        if !notifs.is_empty() {
            self.deferred.push_back(Routed::Notifs(notifs));
        }
    }

    /// Route notification work this server owns: transitive closes
    /// become control tasks, remote refcount changes ride syncs.
    async fn route_notifications(&mut self, mut notifs: Notifications) -> Result<()> {
        for (id, ranks) in std::mem::take(&mut notifs.closes) {
            for rank in ranks {
                self.notify_close(rank, id, None).await?;
            }
        }
        if let Some((id, subscript, ranks)) = notifs.insert.take() {
            for rank in ranks {
                self.notify_close(rank, id, Some(&subscript)).await?;
            }
        }

        let references = std::mem::take(&mut notifs.references);
        if !references.is_empty() {
            let (value_type, value) = notifs.value.take().ok_or(Error::BadNotification)?;
            for reference in references {
                self.set_reference(reference, value_type, value.clone())
                    .await?;
            }
        }

        for (id, change) in std::mem::take(&mut notifs.remote_refcounts) {
            self.forward_refcount(id, change).await?;
        }
        Ok(())
    }

    /// Apply a notification frame returned by a peer for an operation
    /// this server performed on its behalf.
    async fn apply_frame(&mut self, frame: proto::NotificationFrame) -> Result<()> {
        let id = DatumId(frame.id);
        let subscript = subscript_of(&frame.subscript).map(|s| s.to_vec());
        for rank in frame.close_notify {
            self.notify_close(rank, id, None).await?;
        }
        for rank in frame.insert_notify {
            self.notify_close(rank, id, subscript.as_deref()).await?;
        }
        if !frame.references.is_empty() {
            let value_type = DataType::from_code(frame.value_type as i64)
                .map_err(|_| Error::BadNotification)?;
            for reference in frame.references {
                self.set_reference(DatumId(reference), value_type, frame.value.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Wake `rank` with a close notification: a control-type task of
    /// priority one targeted at it, enqueued here when this server is
    /// its home, otherwise forwarded to its home server via sync.
    async fn notify_close(
        &mut self,
        rank: Rank,
        id: DatumId,
        subscript: Option<&[u8]>,
    ) -> Result<()> {
        // Notifications addressed to this very server resolve rules.
        if rank == self.rank {
            return self.rule_closed(id, subscript);
        }

        let payload = notification_payload(id, subscript);
        let home = self.topology.home_server(rank);
        if home == self.rank {
            return self.offer(NewWork {
                work_type: CONTROL_WORK_TYPE,
                priority: CONTROL_PRIORITY,
                putter: self.rank,
                answer: proto::RANK_NULL,
                target: rank,
                parallelism: 1,
                payload,
            });
        }

        if self.sync_to(home, request_sync(), true).await? != SyncOutcome::Accepted {
            return Err(Error::Shutdown);
        }
        self.endpoint.send_record(
            home,
            Tag::Put,
            &proto::PutRequest {
                work_type: CONTROL_WORK_TYPE,
                priority: CONTROL_PRIORITY,
                putter: self.rank,
                answer: proto::RANK_NULL,
                target: rank,
                parallelism: 1,
                payload_len: payload.len() as i64,
                inline_payload: Some(payload),
            },
        )?;
        let reply = self.await_reply(home, &[Tag::ResponsePut]).await?;
        let resp: proto::PutResponse = reply.decode("put response")?;
        if resp.code != Code::Success as i32 {
            tracing::warn!(rank, %id, "close notification rejected");
        }
        Ok(())
    }

    /// Assign `value` to a reference datum: a store of the inserted
    /// value with a write-reference release.
    async fn set_reference(
        &mut self,
        reference: DatumId,
        value_type: DataType,
        value: Bytes,
    ) -> Result<()> {
        let owner = self.topology.shard_owner(reference.0);
        tracing::debug!(%reference, owner, "setting reference");

        if owner == self.rank {
            let mut notifs = Notifications::new();
            match self.store.store(
                reference,
                None,
                value_type,
                &value,
                Refc::WRITE,
                Refc::READ,
                &mut notifs,
            ) {
                Ok(()) => self.defer(notifs),
                Err(err) => tracing::warn!(%reference, %err, "reference assignment failed"),
            }
            return Ok(());
        }

        if self.sync_to(owner, request_sync(), true).await? != SyncOutcome::Accepted {
            return Err(Error::Shutdown);
        }
        self.endpoint.send_record(
            owner,
            Tag::StoreHeader,
            &proto::StoreHeader {
                id: reference.0,
                data_type: value_type.code() as i32,
                subscript_len: 0,
                refcount_decr: Some(Refc::WRITE),
                store_refcounts: Some(Refc::READ),
            },
        )?;
        self.endpoint.send(owner, Tag::StorePayload, value)?;

        let reply = self.await_reply(owner, &[Tag::Response]).await?;
        let resp: proto::StoreResponse = reply.decode("store response")?;
        if let Some(counts) = resp.notifs {
            if counts.total() > 0 {
                let frame = self.await_reply(owner, &[Tag::Notification]).await?;
                let frame: proto::NotificationFrame = frame.decode("notification")?;
                self.deferred.push_back(Routed::Frame(frame));
            }
        }
        if resp.dc != DataCode::Ok as i32 {
            tracing::warn!(%reference, dc = resp.dc, "reference assignment rejected by owner");
        }
        Ok(())
    }

    /// Forward a reference-count change to the owning shard.
    async fn forward_refcount(&mut self, id: DatumId, change: Refc) -> Result<()> {
        let owner = self.topology.shard_owner(id.0);
        debug_assert_ne!(owner, self.rank);

        if self.sync_to(owner, request_sync(), true).await? != SyncOutcome::Accepted {
            return Err(Error::Shutdown);
        }
        self.endpoint.send_record(
            owner,
            Tag::RefcountIncr,
            &proto::RefcountIncrRequest {
                id: id.0,
                change: Some(change),
            },
        )?;
        let reply = self.await_reply(owner, &[Tag::Response]).await?;
        let resp: proto::RefcountResponse = reply.decode("refcount response")?;
        if let Some(counts) = resp.notifs {
            if counts.total() > 0 {
                let frame = self.await_reply(owner, &[Tag::Notification]).await?;
                let frame: proto::NotificationFrame = frame.decode("notification")?;
                self.deferred.push_back(Routed::Frame(frame));
            }
        }
        if resp.dc != DataCode::Ok as i32 {
            tracing::warn!(%id, dc = resp.dc, "forwarded refcount change rejected");
        }
        Ok(())
    }

    // ---- Sync handshake ----

    /// Rendezvous with `target` before talking to it. While waiting,
    /// inbound syncs from higher-ranked servers are served inline and
    /// lower-ranked ones deferred, which breaks sync cycles.
    async fn sync_to(
        &mut self,
        target: Rank,
        request: proto::SyncRequest,
        retry: bool,
    ) -> Result<SyncOutcome> {
        assert!(!self.sync_in_progress, "nested sync");
        self.sync_in_progress = true;
        let result = self.sync_loop(target, request, retry).await;
        self.sync_in_progress = false;
        result
    }

    async fn sync_loop(
        &mut self,
        target: Rank,
        request: proto::SyncRequest,
        retry: bool,
    ) -> Result<SyncOutcome> {
        tracing::trace!(rank = self.rank, target, "sync request");
        self.endpoint
            .send_record(target, Tag::SyncRequest, &request)?;

        let backoff = exponential_backoff::Backoff::new(
            u32::MAX,
            Duration::from_micros(50),
            Some(Duration::from_millis(20)),
        );
        let mut rejections = 0u32;

        loop {
            let env = self
                .endpoint
                .recv_match(
                    None,
                    &[Tag::SyncResponse, Tag::SyncRequest, Tag::ShutdownServer],
                )
                .await?;
            match env.tag {
                Tag::SyncResponse if env.from == target => {
                    let resp: proto::SyncResponse = env.decode("sync response")?;
                    if resp.accepted {
                        return Ok(SyncOutcome::Accepted);
                    }
                    if !retry {
                        return Ok(SyncOutcome::Rejected);
                    }
                    rejections += 1;
                    if let Some(delay) = backoff.next(rejections) {
                        tokio::time::sleep(delay).await;
                    }
                    self.endpoint
                        .send_record(target, Tag::SyncRequest, &request)?;
                }
                Tag::SyncResponse => {
                    tracing::warn!(from = env.from, "sync response from unexpected server");
                }
                Tag::SyncRequest => {
                    let other: proto::SyncRequest = env.decode("sync request")?;
                    self.inbound_sync_while_waiting(env.from, other).await?;
                }
                Tag::ShutdownServer => {
                    self.shutting_down = true;
                    return Err(Error::Shutdown);
                }
                _ => unreachable!("filtered by recv_match"),
            }
        }
    }

    /// An inbound sync that arrives while this server is itself
    /// waiting. Higher ranks are served inline to avoid deadlock;
    /// lower ranks are deferred, or rejected once the buffer fills.
    async fn inbound_sync_while_waiting(
        &mut self,
        other: Rank,
        request: proto::SyncRequest,
    ) -> Result<()> {
        if other > self.rank {
            self.accept_sync(other, request).await
        } else if self.pending_syncs.len() < PENDING_SYNC_MAX {
            tracing::trace!(rank = self.rank, other, "deferring inbound sync");
            self.pending_syncs.push_back((other, request));
            Ok(())
        } else {
            tracing::debug!(rank = self.rank, other, "rejecting inbound sync");
            self.reply(
                other,
                Tag::SyncResponse,
                &proto::SyncResponse { accepted: false },
            )
        }
    }

    /// Accept an inbound sync and serve its request.
    async fn accept_sync(&mut self, peer: Rank, request: proto::SyncRequest) -> Result<()> {
        self.reply(
            peer,
            Tag::SyncResponse,
            &proto::SyncResponse { accepted: true },
        )?;
        if request.mode == proto::SyncMode::Steal as i32 {
            return self.handle_steal(peer, request.steal.unwrap_or_default());
        }

        // A regular sync: exactly one request follows. Shutdown can
        // arrive instead if the peer stopped after requesting.
        let env = self
            .endpoint
            .recv_match(
                None,
                &[
                    Tag::Put,
                    Tag::StoreHeader,
                    Tag::Retrieve,
                    Tag::Subscribe,
                    Tag::RefcountIncr,
                    Tag::ContainerReference,
                    Tag::CreateHeader,
                    Tag::Exists,
                    Tag::ShutdownServer,
                ],
            )
            .await?;
        if env.tag == Tag::ShutdownServer {
            self.shutting_down = true;
            return Err(Error::Shutdown);
        }
        if env.from != peer {
            tracing::warn!(from = env.from, peer, "request from unexpected rank during sync");
        }
        self.dispatch(env).await
    }

    /// Wait for a reply from `peer`, servicing inbound syncs and
    /// observing shutdown meanwhile.
    async fn await_reply(&mut self, peer: Rank, tags: &[Tag]) -> Result<Envelope> {
        let mut want = tags.to_vec();
        want.push(Tag::SyncRequest);
        want.push(Tag::ShutdownServer);
        loop {
            let env = self.endpoint.recv_match(None, &want).await?;
            if env.from == peer && tags.contains(&env.tag) {
                return Ok(env);
            }
            match env.tag {
                Tag::SyncRequest => {
                    let request: proto::SyncRequest = env.decode("sync request")?;
                    self.inbound_sync_while_waiting(env.from, request).await?;
                }
                Tag::ShutdownServer => {
                    self.shutting_down = true;
                    return Err(Error::Shutdown);
                }
                other => {
                    tracing::warn!(from = env.from, tag = %other, "unexpected reply");
                }
            }
        }
    }

    // ---- Steal ----

    /// Whether this server should attempt a steal: parked requests it
    /// cannot satisfy, and any backoff has elapsed.
    fn steal_due(&mut self) -> bool {
        if self.shutting_down || self.topology.servers < 2 || self.requests.is_empty() {
            return false;
        }
        let starved = self
            .requests
            .types_present()
            .into_iter()
            .all(|t| !self.workqueue_has_any(t));
        if !starved {
            return false;
        }
        match self.steal_retry_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    fn workqueue_has_any(&self, work_type: i32) -> bool {
        let counts = self.workqueue.type_counts(self.work_types);
        usize::try_from(work_type)
            .ok()
            .and_then(|t| counts.get(t).copied())
            .map(|c| c > 0)
            .unwrap_or(false)
    }

    async fn try_steal(&mut self) -> Result<()> {
        let peers: Vec<Rank> = self
            .topology
            .server_ranks()
            .filter(|r| *r != self.rank)
            .collect();
        let peer = peers[self.next_steal_peer % peers.len()];
        self.next_steal_peer += 1;

        let request = proto::SyncRequest {
            mode: proto::SyncMode::Steal as i32,
            steal: Some(proto::StealRequest {
                max_memory: self.settings.steal_max_memory as i64,
                work_type_counts: self.workqueue.type_counts(self.work_types),
            }),
        };
        tracing::debug!(rank = self.rank, peer, "attempting steal");

        if self.sync_to(peer, request, false).await? != SyncOutcome::Accepted {
            self.steal_backoff();
            return Ok(());
        }

        let mut received = 0usize;
        loop {
            let env = self.await_reply(peer, &[Tag::ResponseSteal]).await?;
            let batch: proto::StealBatch = env.decode("steal batch")?;
            for frame in batch.units {
                received += 1;
                self.counters.stolen_in(frame.work_type, 1);
                // Identity is preserved; putter and enqueue order are
                // re-derived on arrival.
                self.offer(NewWork {
                    work_type: frame.work_type,
                    priority: frame.priority,
                    putter: self.rank,
                    answer: frame.answer,
                    target: frame.target,
                    parallelism: frame.parallelism,
                    payload: frame.payload,
                })?;
            }
            if batch.last {
                break;
            }
        }
        tracing::debug!(rank = self.rank, peer, received, "steal finished");

        if received == 0 {
            self.steal_backoff();
        } else {
            self.steal_failures = 0;
            self.steal_retry_at = None;
        }
        Ok(())
    }

    fn steal_backoff(&mut self) {
        self.steal_failures += 1;
        let backoff = exponential_backoff::Backoff::new(
            u32::MAX,
            Duration::from_millis(1),
            Some(Duration::from_millis(250)),
        );
        let delay = backoff
            .next(self.steal_failures)
            .unwrap_or(Duration::from_millis(250));
        self.steal_retry_at = Some(Instant::now() + delay);
    }

    /// Serve a steal: donate surplus work, preferring types the caller
    /// reports a shortage of.
    fn handle_steal(&mut self, peer: Rank, request: proto::StealRequest) -> Result<()> {
        let budget = usize::try_from(request.max_memory).unwrap_or(usize::MAX);
        let stolen = self.workqueue.steal(budget, &request.work_type_counts);
        for unit in &stolen {
            self.counters.stolen_out(unit.work_type, 1);
        }
        let batch = proto::StealBatch {
            units: stolen
                .into_iter()
                .map(|unit| proto::WorkUnitFrame {
                    id: unit.id as i64,
                    work_type: unit.work_type,
                    priority: unit.priority,
                    putter: unit.putter,
                    answer: unit.answer,
                    target: unit.target,
                    parallelism: unit.parallelism,
                    payload: unit.payload,
                })
                .collect(),
            last: true,
        };
        self.reply(peer, Tag::ResponseSteal, &batch)
    }

    // ---- Idle detection and shutdown ----

    /// A server is idle when every worker it serves is parked, it has
    /// no queued work, and no sync or routing work is in flight.
    fn locally_idle(&self) -> bool {
        self.workqueue.is_empty()
            && !self.sync_in_progress
            && self.requests.len() == self.my_worker_count()
            && self.deferred.is_empty()
            && self.pending_syncs.is_empty()
    }

    fn handle_check_idle(&mut self, env: Envelope) -> Result<()> {
        let req: proto::CheckIdleRequest = env.decode("check idle")?;
        let resp = proto::CheckIdleResponse {
            idle: self.locally_idle(),
            request_type_counts: self.requests.type_counts(self.work_types),
            work_type_counts: self.workqueue.type_counts(self.work_types),
        };
        tracing::trace!(attempt = req.attempt, idle = resp.idle, "idle check");
        self.reply(env.from, Tag::Response, &resp)
    }

    /// The master polls all peers; when every server is idle at the
    /// same attempt and no queued work matches any parked request
    /// type, it broadcasts shutdown.
    async fn master_idle_check(&mut self) -> Result<()> {
        if !self.locally_idle() {
            return Ok(());
        }
        self.idle_attempt += 1;

        let mut request_counts = self.requests.type_counts(self.work_types);
        let mut work_counts = self.workqueue.type_counts(self.work_types);

        let peers: Vec<Rank> = self
            .topology
            .server_ranks()
            .filter(|r| *r != self.rank)
            .collect();
        for peer in peers {
            self.endpoint.send_record(
                peer,
                Tag::CheckIdle,
                &proto::CheckIdleRequest {
                    attempt: self.idle_attempt,
                },
            )?;
            let reply = self.await_reply(peer, &[Tag::Response]).await?;
            let resp: proto::CheckIdleResponse = reply.decode("check idle response")?;
            if !resp.idle {
                return Ok(());
            }
            for (total, count) in request_counts.iter_mut().zip(&resp.request_type_counts) {
                *total += count;
            }
            for (total, count) in work_counts.iter_mut().zip(&resp.work_type_counts) {
                *total += count;
            }
        }

        // Queued work of a parked type anywhere means a steal will
        // resolve it; not yet idle.
        for (requests, work) in request_counts.iter().zip(&work_counts) {
            if *requests > 0 && *work > 0 {
                return Ok(());
            }
        }

        tracing::info!(attempt = self.idle_attempt, "all servers idle; shutting down");
        self.broadcast_shutdown()?;
        self.shutting_down = true;
        Ok(())
    }

    fn broadcast_shutdown(&mut self) -> Result<()> {
        for peer in self.topology.server_ranks() {
            if peer != self.rank {
                self.endpoint.send(peer, Tag::ShutdownServer, Bytes::new())?;
            }
        }
        Ok(())
    }
}

fn request_sync() -> proto::SyncRequest {
    proto::SyncRequest {
        mode: proto::SyncMode::Request as i32,
        steal: None,
    }
}

fn subscript_of(bytes: &Bytes) -> Option<&[u8]> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes.as_ref())
    }
}
