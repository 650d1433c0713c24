//! In-memory collaborators for running the consumer without any remote service.
//!
//! [`MemoryStreamClient`] simulates a stream with resharding and injectable failures,
//! [`MemoryCheckpointBackend`] a checkpoint table, and [`MemoryAccumulator`] the agent side of
//! delivery tracking. They are used throughout the crate's tests and are handy when embedding
//! the input in another test harness.

use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    accumulator::{Accumulator, DeliveryInfo, TrackingAccumulator, TrackingHandle, TrackingId},
    checkpoint::{self, CheckpointBackend, CheckpointError},
    client::{
        self, GetRecordsOutput, IteratorPosition, ListShardsOutput, Record, ShardIterator,
        StreamClient, StreamClientError,
    },
    handler::{RecordHandler, RecordHandlerError},
    metric::{FieldValue, Metric, ParseError, Parser},
    sequence::SequenceNumber,
    shard::{ChildShard, Shard, ShardId},
};

/// A failure [`MemoryStreamClient`] can be told to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedError {
    ThroughputExceeded,
    ExpiredIterator,
    Other,
}

impl InjectedError {
    fn into_error(self, shard_id: &ShardId) -> StreamClientError {
        match self {
            Self::ThroughputExceeded => StreamClientError::ProvisionedThroughputExceeded(format!(
                "rate exceeded for shard {shard_id}"
            )),
            Self::ExpiredIterator => {
                StreamClientError::ExpiredIterator(format!("iterator for {shard_id} has expired"))
            }
            Self::Other => StreamClientError::other(format!("injected failure for {shard_id}")),
        }
    }
}

/// One call made against a [`MemoryStreamClient`], in the order received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    ListShards {
        next_token: Option<String>,
    },
    GetShardIterator {
        shard_id: ShardId,
        position: IteratorPosition,
    },
    GetRecords {
        shard_id: ShardId,
        returned: usize,
        /// The response ended the shard: no next iterator.
        closed: bool,
    },
    GetRecordsFailed {
        shard_id: ShardId,
        error: InjectedError,
    },
}

#[derive(Debug)]
struct MemoryShard {
    shard: Shard,
    records: Vec<Record>,
    children: Vec<ChildShard>,
    get_records_errors: VecDeque<InjectedError>,
    get_iterator_errors: VecDeque<InjectedError>,
}

impl MemoryShard {
    fn position_index(&self, position: &IteratorPosition) -> usize {
        match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => self.records.len(),
            IteratorPosition::AfterSequenceNumber(after) => self
                .records
                .partition_point(|record| &record.sequence_number <= after),
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    shards: Vec<MemoryShard>,
    /// Outstanding iterators: shard and the index of the next record to return.
    iterators: HashMap<String, (ShardId, usize)>,
    next_iterator: u64,
    list_shards_failures: usize,
    page_size: Option<usize>,
    calls: Vec<ClientCall>,
}

impl StreamState {
    fn shard_mut(&mut self, shard_id: &str) -> &mut MemoryShard {
        match self
            .shards
            .iter_mut()
            .find(|s| s.shard.id.as_str() == shard_id)
        {
            Some(shard) => shard,
            None => panic!("shard {shard_id} was never added to the stream"),
        }
    }

    fn new_iterator(&mut self, shard_id: ShardId, index: usize) -> ShardIterator {
        self.next_iterator += 1;
        let iterator = format!("{shard_id}/{}", self.next_iterator);
        self.iterators.insert(iterator.clone(), (shard_id, index));
        ShardIterator::new(iterator)
    }
}

/// A single stream held in memory.
///
/// Shards are listed in the order they were added. Iterators never expire on their own; use
/// [`fail_get_records`](Self::fail_get_records) to simulate expiry or throttling.
#[derive(Debug)]
pub struct MemoryStreamClient {
    stream_name: String,
    state: Mutex<StreamState>,
}

impl MemoryStreamClient {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Return at most `page_size` shards per `ListShards` page.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = Some(page_size.max(1));
    }

    pub fn add_shard(&self, shard: Shard) {
        self.state.lock().shards.push(MemoryShard {
            shard,
            records: Vec::new(),
            children: Vec::new(),
            get_records_errors: VecDeque::new(),
            get_iterator_errors: VecDeque::new(),
        });
    }

    /// Append a record to an added shard. Sequence numbers must increase.
    ///
    /// # Panics
    ///
    /// If the shard was never added.
    pub fn push_record(&self, shard_id: &str, sequence_number: u64, data: impl Into<Bytes>) {
        let mut state = self.state.lock();
        let shard = state.shard_mut(shard_id);
        let mut record = Record::new(SequenceNumber::from(sequence_number), data);
        record.partition_key = shard_id.to_string();
        shard.records.push(record);
    }

    /// Close a shard at its last record, reporting `children` once a reader reaches the end.
    ///
    /// # Panics
    ///
    /// If the shard was never added.
    pub fn close_shard(&self, shard_id: &str, children: Vec<ChildShard>) {
        let mut state = self.state.lock();
        let shard = state.shard_mut(shard_id);
        let end = shard.records.last().map_or_else(
            || shard.shard.sequence_number_range.start.clone(),
            |record| record.sequence_number.clone(),
        );
        shard.shard.sequence_number_range.end = Some(end);
        shard.children = children;
    }

    /// Fail the next `GetRecords` call on `shard_id` with `error`.
    pub fn fail_get_records(&self, shard_id: &str, error: InjectedError) {
        self.state
            .lock()
            .shard_mut(shard_id)
            .get_records_errors
            .push_back(error);
    }

    /// Fail the next `GetShardIterator` call on `shard_id` with `error`.
    pub fn fail_get_shard_iterator(&self, shard_id: &str, error: InjectedError) {
        self.state
            .lock()
            .shard_mut(shard_id)
            .get_iterator_errors
            .push_back(error);
    }

    /// Fail the next `n` `ListShards` calls.
    pub fn fail_list_shards(&self, n: usize) {
        self.state.lock().list_shards_failures += n;
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.lock().calls.clone()
    }

    pub fn list_shards_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ClientCall::ListShards { .. }))
            .count()
    }

    /// Positions of every iterator requested for `shard_id`, in order.
    pub fn iterator_positions(&self, shard_id: &str) -> Vec<IteratorPosition> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ClientCall::GetShardIterator {
                    shard_id: id,
                    position,
                } if id.as_str() == shard_id => Some(position.clone()),
                _ => None,
            })
            .collect()
    }

    /// `GetRecords` calls for `shard_id`, failed ones included.
    pub fn get_records_calls(&self, shard_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| match call {
                ClientCall::GetRecords { shard_id: id, .. }
                | ClientCall::GetRecordsFailed { shard_id: id, .. } => id.as_str() == shard_id,
                _ => false,
            })
            .count()
    }

    fn check_stream(&self, stream_name: &str) -> client::Result<()> {
        if stream_name == self.stream_name {
            Ok(())
        } else {
            Err(StreamClientError::other(format!(
                "stream {stream_name} not found"
            )))
        }
    }
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn list_shards(
        &self,
        stream_name: &str,
        next_token: Option<&str>,
    ) -> client::Result<ListShardsOutput> {
        let mut state = self.state.lock();
        state.calls.push(ClientCall::ListShards {
            next_token: next_token.map(ToString::to_string),
        });
        self.check_stream(stream_name)?;
        if state.list_shards_failures > 0 {
            state.list_shards_failures -= 1;
            return Err(StreamClientError::other("injected ListShards failure"));
        }

        let offset = match next_token {
            Some(token) => usize::from_str(token)
                .map_err(|_| StreamClientError::other(format!("invalid next token {token}")))?,
            None => 0,
        };
        let end = state
            .page_size
            .map_or(state.shards.len(), |n| (offset + n).min(state.shards.len()));
        let shards = state
            .shards
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|s| s.shard.clone())
            .collect();
        Ok(ListShardsOutput {
            shards,
            next_token: (end < state.shards.len()).then(|| end.to_string()),
        })
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> client::Result<ShardIterator> {
        let mut state = self.state.lock();
        state.calls.push(ClientCall::GetShardIterator {
            shard_id: shard_id.clone(),
            position: position.clone(),
        });
        self.check_stream(stream_name)?;

        let Some(shard) = state.shards.iter_mut().find(|s| &s.shard.id == shard_id) else {
            return Err(StreamClientError::other(format!(
                "shard {shard_id} not found"
            )));
        };
        if let Some(error) = shard.get_iterator_errors.pop_front() {
            return Err(error.into_error(shard_id));
        }
        let index = shard.position_index(position);
        Ok(state.new_iterator(shard_id.clone(), index))
    }

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: Option<u32>,
    ) -> client::Result<GetRecordsOutput> {
        let mut state = self.state.lock();
        let Some((shard_id, index)) = state.iterators.remove(iterator.as_str()) else {
            return Err(StreamClientError::other(format!(
                "unknown shard iterator {iterator}"
            )));
        };
        let shard = state.shard_mut(shard_id.as_str());

        if let Some(error) = shard.get_records_errors.pop_front() {
            // a failed call leaves the iterator usable
            let err = error.into_error(&shard_id);
            state
                .iterators
                .insert(iterator.as_str().to_string(), (shard_id.clone(), index));
            state
                .calls
                .push(ClientCall::GetRecordsFailed { shard_id, error });
            return Err(err);
        }

        let available = shard.records.len().saturating_sub(index);
        let n = limit.map_or(available, |limit| available.min(limit as usize));
        let records = shard.records[index..index + n].to_vec();
        let next_index = index + n;
        let exhausted = shard.shard.is_closed() && next_index >= shard.records.len();
        let child_shards = if exhausted {
            shard.children.clone()
        } else {
            Vec::new()
        };
        let millis_behind_latest = Some(0);

        let next_iterator = (!exhausted).then(|| state.new_iterator(shard_id.clone(), next_index));
        state.calls.push(ClientCall::GetRecords {
            shard_id,
            returned: records.len(),
            closed: exhausted,
        });
        Ok(GetRecordsOutput {
            records,
            next_iterator,
            child_shards,
            millis_behind_latest,
        })
    }
}

#[derive(Debug, Default)]
struct BackendState {
    items: HashMap<(String, ShardId), SequenceNumber>,
    put_failures: HashMap<ShardId, usize>,
    get_failures: HashMap<ShardId, usize>,
    put_delay: Option<Duration>,
    puts: usize,
    gets: usize,
}

/// A checkpoint table held in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointBackend {
    state: Mutex<BackendState>,
}

impl MemoryCheckpointBackend {
    /// The stored value, bypassing call accounting.
    pub fn get(&self, namespace: &str, shard_id: &ShardId) -> Option<SequenceNumber> {
        self.state
            .lock()
            .items
            .get(&(namespace.to_string(), shard_id.clone()))
            .cloned()
    }

    /// Seed a stored value, as if written by an earlier run.
    pub fn insert(&self, namespace: &str, shard_id: &ShardId, sequence_number: SequenceNumber) {
        self.state
            .lock()
            .items
            .insert((namespace.to_string(), shard_id.clone()), sequence_number);
    }

    /// Successful writes so far.
    pub fn put_count(&self) -> usize {
        self.state.lock().puts
    }

    pub fn get_count(&self) -> usize {
        self.state.lock().gets
    }

    /// Fail the next `n` writes for `shard_id`.
    pub fn fail_puts_for(&self, shard_id: &ShardId, n: usize) {
        *self
            .state
            .lock()
            .put_failures
            .entry(shard_id.clone())
            .or_default() += n;
    }

    /// Fail the next `n` reads for `shard_id`.
    pub fn fail_gets_for(&self, shard_id: &ShardId, n: usize) {
        *self
            .state
            .lock()
            .get_failures
            .entry(shard_id.clone())
            .or_default() += n;
    }

    /// Make every write take `delay` before completing.
    pub fn set_put_delay(&self, delay: Duration) {
        self.state.lock().put_delay = Some(delay);
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn get_item(
        &self,
        namespace: &str,
        shard_id: &ShardId,
    ) -> checkpoint::Result<Option<SequenceNumber>> {
        let mut state = self.state.lock();
        state.gets += 1;
        if let Some(remaining) = state.get_failures.get_mut(shard_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CheckpointError::backend(format!(
                    "injected read failure for {shard_id}"
                )));
            }
        }
        Ok(state
            .items
            .get(&(namespace.to_string(), shard_id.clone()))
            .cloned())
    }

    async fn put_item(
        &self,
        namespace: &str,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> checkpoint::Result<()> {
        let delay = self.state.lock().put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.put_failures.get_mut(shard_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CheckpointError::backend(format!(
                    "injected write failure for {shard_id}"
                )));
            }
        }
        state.items.insert(
            (namespace.to_string(), shard_id.clone()),
            sequence_number.clone(),
        );
        state.puts += 1;
        Ok(())
    }
}

/// What [`MemoryAccumulator`] does with groups once they are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    /// Report every group delivered straight away.
    Deliver,
    /// Report every group rejected straight away.
    Reject,
    /// Wait for [`MemoryAccumulator::confirm`].
    Manual,
}

#[derive(Debug)]
struct AccumulatorState {
    confirmation: Confirmation,
    next_id: AtomicU64,
    groups: Mutex<Vec<(TrackingId, Vec<Metric>)>>,
    delivered: Mutex<Option<mpsc::Sender<DeliveryInfo>>>,
}

/// Records every tracked metric group and reports delivery either immediately or on demand.
///
/// Clones share state, so a test can keep one while the input owns another.
#[derive(Debug, Clone)]
pub struct MemoryAccumulator {
    state: Arc<AccumulatorState>,
}

impl MemoryAccumulator {
    fn with_confirmation(confirmation: Confirmation) -> Self {
        Self {
            state: Arc::new(AccumulatorState {
                confirmation,
                next_id: AtomicU64::new(1),
                groups: Mutex::new(Vec::new()),
                delivered: Mutex::new(None),
            }),
        }
    }

    /// Every group is delivered as soon as it is added.
    pub fn auto() -> Self {
        Self::with_confirmation(Confirmation::Deliver)
    }

    /// Every group is rejected as soon as it is added.
    pub fn rejecting() -> Self {
        Self::with_confirmation(Confirmation::Reject)
    }

    /// Groups stay undelivered until [`confirm`](Self::confirm)ed.
    pub fn manual() -> Self {
        Self::with_confirmation(Confirmation::Manual)
    }

    /// Report the outcome of group `id`; `false` if the report could not be sent.
    pub fn confirm(&self, id: TrackingId, delivered: bool) -> bool {
        self.state.report(DeliveryInfo { id, delivered })
    }

    pub fn groups(&self) -> Vec<(TrackingId, Vec<Metric>)> {
        self.state.groups.lock().clone()
    }

    /// All metrics added so far, in order.
    pub fn metrics(&self) -> Vec<Metric> {
        self.state
            .groups
            .lock()
            .iter()
            .flat_map(|(_, metrics)| metrics.iter().cloned())
            .collect()
    }
}

impl AccumulatorState {
    fn report(&self, info: DeliveryInfo) -> bool {
        match self.delivered.lock().as_ref() {
            Some(tx) => tx.try_send(info).is_ok(),
            None => false,
        }
    }
}

impl Accumulator for MemoryAccumulator {
    fn with_tracking(&self, max_in_flight: usize) -> TrackingHandle {
        let (tx, rx) = mpsc::channel(max_in_flight.max(1));
        *self.state.delivered.lock() = Some(tx);
        TrackingHandle {
            accumulator: Arc::new(MemoryTracker {
                state: Arc::clone(&self.state),
            }),
            delivered: rx,
        }
    }
}

#[derive(Debug)]
struct MemoryTracker {
    state: Arc<AccumulatorState>,
}

impl TrackingAccumulator for MemoryTracker {
    fn add_tracking_metric_group(&self, metrics: Vec<Metric>) -> TrackingId {
        let id = TrackingId::new(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.groups.lock().push((id, metrics));
        match self.state.confirmation {
            Confirmation::Deliver => {
                self.state.report(DeliveryInfo {
                    id,
                    delivered: true,
                });
            }
            Confirmation::Reject => {
                self.state.report(DeliveryInfo {
                    id,
                    delivered: false,
                });
            }
            Confirmation::Manual => {}
        }
        id
    }
}

/// Remembers every record it is given, optionally failing at one sequence number.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    records: Mutex<Vec<(ShardId, Record)>>,
    fail_at: Option<SequenceNumber>,
}

impl RecordingHandler {
    /// Fails when handed the record with `sequence_number`, on any shard.
    pub fn failing_at(sequence_number: SequenceNumber) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_at: Some(sequence_number),
        }
    }

    pub fn records(&self, shard_id: &str) -> Vec<Record> {
        self.records
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() == shard_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn sequence_numbers(&self, shard_id: &str) -> Vec<SequenceNumber> {
        self.records(shard_id)
            .into_iter()
            .map(|record| record.sequence_number)
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle_record(
        &self,
        _cancel: &CancellationToken,
        shard_id: &ShardId,
        record: Record,
    ) -> Result<(), RecordHandlerError> {
        if self.fail_at.as_ref() == Some(&record.sequence_number) {
            return Err(RecordHandlerError::Failed(
                format!("refusing record {}", record.sequence_number).into(),
            ));
        }
        self.records.lock().push((shard_id.clone(), record));
        Ok(())
    }
}

/// One metric per non-empty line, named after the line, with the line as its `raw` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser;

impl Parser for LineParser {
    fn parse(&self, payload: &[u8]) -> Result<Vec<Metric>, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|e| ParseError(e.to_string()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                Metric::new(line, DateTime::<Utc>::UNIX_EPOCH)
                    .with_field("raw", FieldValue::String(line.to_string()))
            })
            .collect())
    }
}
