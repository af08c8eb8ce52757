use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use tokio::sync::mpsc::UnboundedSender;

use mccache_wire::{Checksum, OpCode, OutboundOp};

use crate::{clock, CacheError, CacheMetrics, ChangeCallback, ChangeEvent, ChangeKind};

/// Two or more mutations inside this window count toward the spike metric.
const SPIKE_WINDOW_NS: u64 = 5_000_000_000;

/// Bounds and knobs for one cache instance.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Maximum number of entries before FIFO eviction.
    pub max_entries: usize,
    /// Maximum aggregate bytes (keys plus values) before FIFO eviction.
    pub max_bytes: usize,
    /// Per-entry time to live; zero disables the sweep.
    pub ttl: Duration,
    /// How recently an entry must have been read for a mutation to fire the
    /// change callback.
    pub callback_window: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_entries: 256,
            max_bytes: 8 * 1024 * 1024,
            ttl: Duration::from_secs(3600),
            callback_window: Duration::from_secs(5),
        }
    }
}

/// Where a mutation came from.  Remote mutations were applied by the opcode
/// handler on behalf of a peer and are never queued back out; that is what
/// keeps one write from echoing around the group forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Coherence metadata for one entry.
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    pub tsm: u64,
    pub crc: Checksum,
    pub lkp: u64,
}

struct Entry {
    value: Vec<u8>,
    tsm: u64,
    crc: Checksum,
    lkp: u64,
    seq: u64,
}

/// An insertion-ordered byte-keyed map with coherence metadata.
///
/// Keys and values arrive already serialized; the typed facade lives in the
/// engine crate.  Entries are indexed twice: by key for O(1) access and by a
/// monotonically increasing sequence number for FIFO eviction.  Updates move
/// an entry to the back of the order, so the front is always the
/// least-recently-mutated entry.
pub struct LocalCache {
    name: String,
    opts: CacheOptions,
    entries: HashMap<Vec<u8>, Entry>,
    order: BTreeMap<u64, Vec<u8>>,
    next_seq: u64,
    total_bytes: usize,
    queue: Option<UnboundedSender<OutboundOp>>,
    callback: Option<ChangeCallback>,
    metrics: CacheMetrics,
    touched: u64,
}

impl LocalCache {
    pub fn new(
        name: impl Into<String>,
        opts: CacheOptions,
        queue: Option<UnboundedSender<OutboundOp>>,
    ) -> Self {
        LocalCache {
            name: name.into(),
            opts,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            total_bytes: 0,
            queue,
            callback: None,
            metrics: CacheMetrics::default(),
            touched: clock::tsm_now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_callback(&mut self, callback: Option<ChangeCallback>) {
        self.callback = callback;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Counters plus the live entry count and byte total.
    pub fn metrics(&self) -> CacheMetrics {
        let mut m = self.metrics.clone();
        m.entry_count = self.entries.len() as u64;
        m.total_bytes = self.total_bytes as u64;
        m
    }

    pub fn meta(&self, key: &[u8]) -> Option<EntryMeta> {
        self.entries.get(key).map(|e| EntryMeta {
            tsm: e.tsm,
            crc: e.crc,
            lkp: e.lkp,
        })
    }

    /// Look up a value, refreshing its last-lookup timestamp.
    pub fn get(&mut self, key: &[u8]) -> Option<&[u8]> {
        let now = clock::tsm_now();
        self.sweep_expired(now, Origin::Local);
        self.metrics.lookups += 1;
        if !self.entries.contains_key(key) {
            self.metrics.misses += 1;
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.lkp = now;
        Some(entry.value.as_slice())
    }

    pub fn contains(&mut self, key: &[u8]) -> bool {
        self.sweep_expired(clock::tsm_now(), Origin::Local);
        self.entries.contains_key(key)
    }

    /// Insert or overwrite an entry.
    ///
    /// `tsm` is the version of the mutation; `None` stamps it from the
    /// process clock (the local-mutation path).  The opcode handler passes
    /// the originator's timestamp and `Origin::Remote` instead.
    pub fn set(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        tsm: Option<u64>,
        origin: Origin,
    ) -> Result<(), CacheError> {
        let wall = clock::tsm_now();
        let tsm = tsm.unwrap_or(wall);
        self.sweep_expired(wall, origin);

        let incoming = key.len() + value.len();
        if incoming > self.opts.max_bytes {
            return Err(CacheError::ValueTooLarge {
                size: incoming,
                limit: self.opts.max_bytes,
            });
        }

        let crc = Checksum::of(&value);
        let prior = self.entries.remove(&key);
        let (update, lkp, prev_crc) = match &prior {
            Some(entry) => {
                self.order.remove(&entry.seq);
                self.total_bytes = self
                    .total_bytes
                    .saturating_sub(key.len() + entry.value.len());
                (true, entry.lkp, Some(entry.crc))
            }
            None => (false, tsm, None),
        };

        self.make_room(incoming, origin);

        if origin == Origin::Local {
            if let Some(queue) = &self.queue {
                let _ = queue.send(OutboundOp {
                    opcode: if update { OpCode::Upd } else { OpCode::Ins },
                    tsm,
                    namespace: Some(self.name.clone()),
                    key: Some(key.clone()),
                    crc: Some(crc),
                    value: Some(value.clone()),
                    target: None,
                });
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.total_bytes += incoming;
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                tsm,
                crc,
                lkp,
                seq,
            },
        );

        if update {
            self.metrics.updates += 1;
            self.notify_if_recent(ChangeKind::Update, &key, lkp, tsm, prev_crc, Some(crc));
        } else {
            self.metrics.inserts += 1;
        }
        self.note_mutation(wall);
        Ok(())
    }

    /// Remove an entry.  Fails with `KeyMissing` when it is not present.
    pub fn delete(
        &mut self,
        key: &[u8],
        tsm: Option<u64>,
        origin: Origin,
    ) -> Result<(), CacheError> {
        let wall = clock::tsm_now();
        let tsm = tsm.unwrap_or(wall);
        self.sweep_expired(wall, origin);

        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| CacheError::key_missing(key))?;
        self.order.remove(&entry.seq);
        self.total_bytes = self
            .total_bytes
            .saturating_sub(key.len() + entry.value.len());

        if origin == Origin::Local {
            if let Some(queue) = &self.queue {
                let _ = queue.send(OutboundOp {
                    opcode: OpCode::Del,
                    tsm,
                    namespace: Some(self.name.clone()),
                    key: Some(key.to_vec()),
                    crc: Some(entry.crc),
                    value: None,
                    target: None,
                });
            }
        }

        self.metrics.deletes += 1;
        self.notify_if_recent(
            ChangeKind::Deletion,
            key,
            entry.lkp,
            tsm,
            Some(entry.crc),
            None,
        );
        self.note_mutation(wall);
        Ok(())
    }

    /// Drop an entry whose replica diverged: a conflicting update proved the
    /// local copy cannot be trusted, so both sides fall back to the backing
    /// store.  Nothing is broadcast.
    pub fn evict_incoherent(&mut self, key: &[u8], inbound_tsm: u64, inbound_crc: Option<Checksum>) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
            self.total_bytes = self
                .total_bytes
                .saturating_sub(key.len() + entry.value.len());
            self.metrics.evicts += 1;
            self.notify_if_recent(
                ChangeKind::Incoherence,
                key,
                entry.lkp,
                inbound_tsm,
                Some(entry.crc),
                inbound_crc,
            );
        }
    }

    /// Remove every entry.  Local bookkeeping only; the cluster-wide reset
    /// travels as an `RST` operation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }

    /// Remove and return a value without announcing anything to the group.
    pub fn pop(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.sweep_expired(clock::tsm_now(), Origin::Local);
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.total_bytes = self
            .total_bytes
            .saturating_sub(key.len() + entry.value.len());
        self.metrics.deletes += 1;
        self.note_mutation(clock::tsm_now());
        Some(entry.value)
    }

    /// Remove and return the oldest (FIFO) entry.
    pub fn pop_oldest(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.sweep_expired(clock::tsm_now(), Origin::Local);
        let (&seq, key) = self.order.first_key_value()?;
        let key = key.clone();
        self.order.remove(&seq);
        let entry = self.entries.remove(&key)?;
        self.total_bytes = self
            .total_bytes
            .saturating_sub(key.len() + entry.value.len());
        self.metrics.deletes += 1;
        Some((key, entry.value))
    }

    /// Keys in insertion order.
    pub fn keys(&mut self) -> Vec<Vec<u8>> {
        self.sweep_expired(clock::tsm_now(), Origin::Local);
        self.order.values().cloned().collect()
    }

    /// Key/value pairs in insertion order.
    pub fn items(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.sweep_expired(clock::tsm_now(), Origin::Local);
        self.order
            .values()
            .filter_map(|k| self.entries.get(k).map(|e| (k.clone(), e.value.clone())))
            .collect()
    }

    /// A `key -> {crc, tsm}` view for the `INQ` operation.  Raw values stay
    /// out of the log on purpose.
    pub fn digest(&self, key: Option<&[u8]>) -> serde_json::Value {
        let mut view = serde_json::Map::new();
        for (k, entry) in self
            .entries
            .iter()
            .filter(|(k, _)| key.is_none() || key == Some(k.as_slice()))
        {
            view.insert(
                STANDARD_NO_PAD.encode(k),
                serde_json::json!({
                    "crc": entry.crc.to_string(),
                    "tsm": entry.tsm,
                }),
            );
        }
        serde_json::Value::Object(view)
    }

    // Expire from the front of the order until the first live entry.  The
    // front is the least-recently-mutated entry, so its tsm is the oldest.
    fn sweep_expired(&mut self, now: u64, origin: Origin) {
        let ttl = self.opts.ttl.as_nanos() as u64;
        if ttl == 0 {
            return;
        }
        loop {
            let Some((&seq, key)) = self.order.first_key_value() else {
                break;
            };
            let key = key.clone();
            let expired = match self.entries.get(&key) {
                Some(entry) => now.saturating_sub(entry.tsm) > ttl,
                None => {
                    // The two indexes drifted; repair and keep sweeping.
                    self.order.remove(&seq);
                    continue;
                }
            };
            if !expired {
                break;
            }
            self.evict_one(&key, origin);
        }
    }

    // FIFO-evict until the incoming entry fits both budgets.
    fn make_room(&mut self, incoming: usize, origin: Origin) {
        while !self.entries.is_empty()
            && (self.entries.len() + 1 > self.opts.max_entries
                || self.total_bytes + incoming > self.opts.max_bytes)
        {
            let Some((_, key)) = self.order.first_key_value() else {
                break;
            };
            let key = key.clone();
            self.evict_one(&key, origin);
        }
    }

    fn evict_one(&mut self, key: &[u8], origin: Origin) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
            self.total_bytes = self
                .total_bytes
                .saturating_sub(key.len() + entry.value.len());
            self.metrics.evicts += 1;
            if origin == Origin::Local {
                if let Some(queue) = &self.queue {
                    let _ = queue.send(OutboundOp {
                        opcode: OpCode::Evt,
                        tsm: clock::tsm_now(),
                        namespace: Some(self.name.clone()),
                        key: Some(key.to_vec()),
                        crc: Some(entry.crc),
                        value: None,
                        target: None,
                    });
                }
            }
        }
    }

    fn notify_if_recent(
        &self,
        kind: ChangeKind,
        key: &[u8],
        lkp: u64,
        tsm: u64,
        prev_crc: Option<Checksum>,
        new_crc: Option<Checksum>,
    ) {
        let Some(callback) = &self.callback else {
            return;
        };
        let window = self.opts.callback_window.as_nanos() as u64;
        let elapsed = clock::tsm_now().saturating_sub(lkp);
        if window == 0 || elapsed > window {
            return;
        }
        callback(&ChangeEvent {
            kind,
            namespace: self.name.clone(),
            key: key.to_vec(),
            lkp,
            tsm,
            elapsed_ns: elapsed,
            prev_crc,
            new_crc,
        });
    }

    fn note_mutation(&mut self, now: u64) {
        let span = now.saturating_sub(self.touched);
        if span == 0 {
            return;
        }
        self.touched = now;
        if span <= SPIKE_WINDOW_NS {
            let spikes = self.metrics.spikes;
            self.metrics.spike_interval_ns = (self.metrics.spike_interval_ns * spikes as f64
                + span as f64)
                / (spikes + 1) as f64;
            self.metrics.spikes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn opts() -> CacheOptions {
        CacheOptions {
            max_entries: 4,
            max_bytes: 1024,
            ttl: Duration::ZERO,
            callback_window: Duration::from_secs(5),
        }
    }

    fn cache(opts: CacheOptions) -> (LocalCache, mpsc::UnboundedReceiver<OutboundOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalCache::new("unit", opts, Some(tx)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundOp>) -> Vec<OutboundOp> {
        let mut ops = Vec::new();
        while let Ok(op) = rx.try_recv() {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn set_get_round_trip_updates_metadata() {
        let (mut c, _rx) = cache(opts());
        c.set(b"k".to_vec(), b"v1".to_vec(), None, Origin::Local)
            .unwrap();
        assert_eq!(c.get(b"k"), Some(b"v1".as_slice()));
        let meta = c.meta(b"k").unwrap();
        assert_eq!(meta.crc, Checksum::of(b"v1"));
        assert!(meta.lkp >= meta.tsm);

        c.set(b"k".to_vec(), b"v2".to_vec(), None, Origin::Local)
            .unwrap();
        let newer = c.meta(b"k").unwrap();
        assert!(newer.tsm > meta.tsm);
        assert_ne!(newer.crc, meta.crc);
    }

    #[test]
    fn local_mutations_queue_ins_upd_del_and_remote_ones_do_not() {
        let (mut c, mut rx) = cache(opts());
        c.set(b"k".to_vec(), b"v1".to_vec(), None, Origin::Local)
            .unwrap();
        c.set(b"k".to_vec(), b"v2".to_vec(), None, Origin::Local)
            .unwrap();
        c.delete(b"k", None, Origin::Local).unwrap();
        let opcodes: Vec<OpCode> = drain(&mut rx).into_iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![OpCode::Ins, OpCode::Upd, OpCode::Del]);

        c.set(b"k".to_vec(), b"v3".to_vec(), Some(clock::tsm_now()), Origin::Remote)
            .unwrap();
        c.delete(b"k", None, Origin::Remote).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn entry_budget_evicts_fifo_and_announces_evt() {
        let (mut c, mut rx) = cache(opts());
        for i in 0u8..4 {
            c.set(vec![i], vec![i], None, Origin::Local).unwrap();
        }
        drain(&mut rx);
        // A fifth entry pushes out the first-inserted key.
        c.set(vec![9], vec![9], None, Origin::Local).unwrap();
        assert_eq!(c.len(), 4);
        assert!(c.meta(&[0]).is_none());
        let ops = drain(&mut rx);
        assert_eq!(ops[0].opcode, OpCode::Evt);
        assert_eq!(ops[0].key.as_deref(), Some(&[0u8][..]));
        assert_eq!(ops[1].opcode, OpCode::Ins);
    }

    #[test]
    fn update_moves_entry_to_the_back_of_the_fifo() {
        let (mut c, _rx) = cache(opts());
        for i in 0u8..4 {
            c.set(vec![i], vec![i], None, Origin::Local).unwrap();
        }
        // Refresh key 0; key 1 is now the eviction candidate.
        c.set(vec![0], vec![42], None, Origin::Local).unwrap();
        c.set(vec![9], vec![9], None, Origin::Local).unwrap();
        assert!(c.meta(&[0]).is_some());
        assert!(c.meta(&[1]).is_none());
    }

    #[test]
    fn byte_budget_holds_and_oversize_values_are_rejected() {
        let mut o = opts();
        o.max_entries = 1000;
        o.max_bytes = 100;
        let (mut c, _rx) = cache(o);
        let err = c
            .set(b"k".to_vec(), vec![0u8; 200], None, Origin::Local)
            .unwrap_err();
        assert!(matches!(err, CacheError::ValueTooLarge { .. }));

        for i in 0u8..10 {
            c.set(vec![i], vec![0u8; 30], None, Origin::Local).unwrap();
            assert!(c.total_bytes() <= 100);
        }
    }

    #[test]
    fn ttl_sweep_expires_from_the_front_and_emits_one_evt_each() {
        let mut o = opts();
        o.ttl = Duration::from_millis(30);
        let (mut c, mut rx) = cache(o);
        c.set(b"a".to_vec(), b"1".to_vec(), None, Origin::Local)
            .unwrap();
        c.set(b"b".to_vec(), b"2".to_vec(), None, Origin::Local)
            .unwrap();
        drain(&mut rx);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(c.get(b"a"), None);
        assert!(c.is_empty());
        let evts: Vec<OutboundOp> = drain(&mut rx);
        assert_eq!(evts.len(), 2);
        assert!(evts.iter().all(|op| op.opcode == OpCode::Evt));

        // Further lookups stay misses without emitting anything more.
        assert_eq!(c.get(b"a"), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn lookup_and_miss_counters() {
        let (mut c, _rx) = cache(opts());
        c.set(b"k".to_vec(), b"v".to_vec(), None, Origin::Local)
            .unwrap();
        c.get(b"k");
        c.get(b"k");
        c.get(b"absent");
        let m = c.metrics();
        assert_eq!(m.lookups, 3);
        assert_eq!(m.misses, 1);
        assert_eq!(m.inserts, 1);
    }

    #[test]
    fn rapid_mutations_count_as_spikes() {
        let (mut c, _rx) = cache(opts());
        for i in 0u8..5 {
            c.set(vec![0], vec![i], None, Origin::Local).unwrap();
        }
        let m = c.metrics();
        assert!(m.spikes >= 4);
        assert!(m.spike_interval_ns > 0.0);
        assert!(m.spike_interval_ns < SPIKE_WINDOW_NS as f64);
    }

    #[test]
    fn callback_fires_for_mutation_soon_after_a_read() {
        let (mut c, _rx) = cache(opts());
        let seen: Arc<Mutex<Vec<ChangeKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        c.set_callback(Some(Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.kind);
        })));

        c.set(b"k".to_vec(), b"v1".to_vec(), None, Origin::Local)
            .unwrap();
        c.get(b"k");
        c.set(b"k".to_vec(), b"v2".to_vec(), None, Origin::Remote)
            .unwrap();
        c.delete(b"k", None, Origin::Remote).unwrap();
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![ChangeKind::Update, ChangeKind::Deletion]
        );
    }

    #[test]
    fn callback_respects_the_window() {
        let mut o = opts();
        o.callback_window = Duration::from_nanos(1);
        let (mut c, _rx) = cache(o);
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        c.set_callback(Some(Arc::new(move |_: &ChangeEvent| {
            sink.fetch_add(1, Ordering::SeqCst);
        })));

        c.set(b"k".to_vec(), b"v1".to_vec(), None, Origin::Local)
            .unwrap();
        c.get(b"k");
        c.set(b"k".to_vec(), b"v2".to_vec(), None, Origin::Local)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn incoherence_eviction_is_silent_on_the_wire() {
        let (mut c, mut rx) = cache(opts());
        c.set(b"k".to_vec(), b"v1".to_vec(), None, Origin::Local)
            .unwrap();
        drain(&mut rx);
        c.evict_incoherent(b"k", clock::tsm_now(), Some(Checksum::of(b"other")));
        assert!(c.meta(b"k").is_none());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(c.metrics().evicts, 1);
    }

    #[test]
    fn delete_missing_key_fails() {
        let (mut c, _rx) = cache(opts());
        assert!(matches!(
            c.delete(b"nope", None, Origin::Local),
            Err(CacheError::KeyMissing { .. })
        ));
    }

    #[test]
    fn keys_and_items_iterate_in_insertion_order() {
        let (mut c, _rx) = cache(opts());
        c.set(b"a".to_vec(), b"1".to_vec(), None, Origin::Local)
            .unwrap();
        c.set(b"b".to_vec(), b"2".to_vec(), None, Origin::Local)
            .unwrap();
        c.set(b"a".to_vec(), b"3".to_vec(), None, Origin::Local)
            .unwrap();
        assert_eq!(c.keys(), vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(
            c.items(),
            vec![(b"b".to_vec(), b"2".to_vec()), (b"a".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn digest_exposes_checksums_not_values() {
        let (mut c, _rx) = cache(opts());
        c.set(b"k".to_vec(), b"v".to_vec(), None, Origin::Local)
            .unwrap();
        let digest = c.digest(None);
        let entry = digest.as_object().unwrap().values().next().unwrap();
        assert_eq!(
            entry["crc"].as_str().unwrap(),
            Checksum::of(b"v").to_string()
        );
        assert!(entry["tsm"].as_u64().unwrap() > 0);
    }
}
