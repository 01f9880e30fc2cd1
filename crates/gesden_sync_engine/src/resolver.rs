//! Conflict detection and resolution.
//!
//! Resolution runs field-level first: changes are diffed against the
//! last synced base, and disjoint field sets merge with no conflict.
//! Only fields both sides changed to different values are disputed.
//! Disputed ordinary fields resolve by last-writer-wins (Postgres wins
//! exact ties); disputed clinical-safety or monetary fields always go
//! to manual review, regardless of any learned pattern.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::journal::{Journal, JournalRecord};
use chrono::{DateTime, Utc};
use gesden_sync_protocol::{
    Conflict, ConflictSummary, RecordPayload, ResolutionStrategy, StoreSide,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of resolving two versions of a record.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The versions carry identical data; nothing to write.
    Unchanged,
    /// Changed field sets were disjoint; both sides' changes kept.
    Merged(RecordPayload),
    /// Disputed fields resolved automatically.
    AutoResolved {
        /// The version to apply to both stores.
        resolved: RecordPayload,
        /// The audit record of the resolution.
        conflict: Conflict,
    },
    /// Disputed fields require a human decision.
    NeedsManual {
        /// The unresolved conflict.
        conflict: Conflict,
    },
}

/// A learned resolution pattern for one conflict shape.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    /// Strategy recorded for this shape.
    pub strategy: ResolutionStrategy,
    /// Times this shape has been seen.
    pub occurrences: u32,
    /// Whether an operator pinned the strategy explicitly.
    pub pinned: bool,
    /// Last time the shape occurred.
    pub last_seen: DateTime<Utc>,
}

/// Records conflict shapes and the strategies that resolved them.
///
/// Keyed by `table:field1,field2,...` (fields sorted). A shape's
/// strategy is honored once pinned by an operator or seen often
/// enough to pass the confidence threshold.
#[derive(Debug, Default)]
pub struct PatternStore {
    patterns: RwLock<HashMap<String, PatternEntry>>,
}

impl PatternStore {
    /// Creates an empty pattern store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the pattern key for a conflict shape.
    pub fn shape_key(table: gesden_sync_protocol::SyncTable, fields: &[&str]) -> String {
        let mut sorted: Vec<&str> = fields.to_vec();
        sorted.sort_unstable();
        format!("{}:{}", table, sorted.join(","))
    }

    /// Records an occurrence of a shape resolved with a strategy.
    pub fn record(&self, key: &str, strategy: ResolutionStrategy, now: DateTime<Utc>) {
        let mut patterns = self.patterns.write();
        let entry = patterns.entry(key.to_string()).or_insert(PatternEntry {
            strategy,
            occurrences: 0,
            pinned: false,
            last_seen: now,
        });
        entry.occurrences = entry.occurrences.saturating_add(1);
        entry.last_seen = now;
        if !entry.pinned {
            entry.strategy = strategy;
        }
    }

    /// Pins a strategy for a shape; subsequent conflicts of this shape
    /// use it regardless of occurrence count.
    pub fn pin(&self, key: &str, strategy: ResolutionStrategy, now: DateTime<Utc>) {
        let mut patterns = self.patterns.write();
        let entry = patterns.entry(key.to_string()).or_insert(PatternEntry {
            strategy,
            occurrences: 0,
            pinned: true,
            last_seen: now,
        });
        entry.strategy = strategy;
        entry.pinned = true;
    }

    /// Looks up a shape.
    pub fn lookup(&self, key: &str) -> Option<PatternEntry> {
        self.patterns.read().get(key).cloned()
    }

    /// Number of known shapes.
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    /// Returns true if no shape has been recorded.
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

const AUTO_ARCHIVE_CAP: usize = 256;

/// Conflicts recorded by the engine: pending manual reviews plus a
/// bounded archive of automatic resolutions.
///
/// Pending entries are journaled before they become visible, so a
/// conflict parked for review outlives a restart. The archive and the
/// counters are in-memory only.
#[derive(Debug)]
pub struct ConflictLog {
    journal: Arc<Journal>,
    pending: RwLock<Vec<Conflict>>,
    archive: RwLock<VecDeque<Conflict>>,
    auto_resolved: AtomicU64,
    merged: AtomicU64,
}

impl ConflictLog {
    /// Creates an empty log backed by the journal.
    pub fn new(journal: Arc<Journal>) -> Self {
        Self::recover(journal, Vec::new())
    }

    /// Builds a log from pending conflicts recovered off the journal.
    pub fn recover(journal: Arc<Journal>, pending: Vec<Conflict>) -> Self {
        Self {
            journal,
            pending: RwLock::new(pending),
            archive: RwLock::new(VecDeque::new()),
            auto_resolved: AtomicU64::new(0),
            merged: AtomicU64::new(0),
        }
    }

    /// Records an automatically resolved conflict.
    pub fn record_auto(&self, conflict: Conflict) {
        self.auto_resolved.fetch_add(1, Ordering::Relaxed);
        let mut archive = self.archive.write();
        if archive.len() == AUTO_ARCHIVE_CAP {
            archive.pop_front();
        }
        archive.push_back(conflict);
    }

    /// Records a disjoint-field merge (no real conflict).
    pub fn record_merged(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a conflict awaiting manual review.
    ///
    /// A record has at most one pending conflict; a newer detection
    /// for the same record replaces the older one. The journal append
    /// happens before the in-memory insert.
    pub fn record_manual(&self, conflict: Conflict) -> EngineResult<()> {
        let mut pending = self.pending.write();
        self.journal.append(&JournalRecord::Conflict {
            conflict: conflict.clone(),
        })?;
        pending.retain(|c| c.table != conflict.table || c.record_id != conflict.record_id);
        pending.push(conflict);
        Ok(())
    }

    /// Conflicts awaiting manual review.
    pub fn pending(&self) -> Vec<Conflict> {
        self.pending.read().clone()
    }

    /// Removes a pending conflict once an operator has dealt with it.
    pub fn archive_pending(&self, id: uuid::Uuid) -> EngineResult<Option<Conflict>> {
        let mut pending = self.pending.write();
        let Some(index) = pending.iter().position(|c| c.id == id) else {
            return Ok(None);
        };
        self.journal.append(&JournalRecord::ConflictArchived { id })?;
        let conflict = pending.remove(index);
        let mut archive = self.archive.write();
        if archive.len() == AUTO_ARCHIVE_CAP {
            archive.pop_front();
        }
        archive.push_back(conflict.clone());
        Ok(Some(conflict))
    }

    /// Aggregate counts for the status API.
    pub fn summary(&self) -> ConflictSummary {
        ConflictSummary {
            auto_resolved: self.auto_resolved.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            pending_manual: self.pending.read().len() as u64,
        }
    }
}

/// Resolves divergent versions of a record.
pub struct ConflictResolver {
    patterns: PatternStore,
    confidence_threshold: u32,
    default_strategy: ResolutionStrategy,
}

impl ConflictResolver {
    /// Creates a resolver with the configured confidence threshold and
    /// last-writer-wins as the default strategy.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            patterns: PatternStore::new(),
            confidence_threshold: config.pattern_confidence_threshold,
            default_strategy: ResolutionStrategy::LastWriterWins,
        }
    }

    /// Overrides the default strategy for disputed ordinary fields.
    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Access to the learned pattern store.
    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    /// Resolves `local` (the target store's current version) against
    /// `remote` (the incoming version from `remote_side`).
    ///
    /// `base` is the last synced snapshot, if known; without it every
    /// differing field is treated as disputed. Deterministic: the same
    /// inputs and pattern state always produce the same winner.
    pub fn resolve(
        &self,
        base: Option<&RecordPayload>,
        local: &RecordPayload,
        remote: &RecordPayload,
        remote_side: StoreSide,
        now: DateTime<Utc>,
    ) -> EngineResult<Resolution> {
        let direct = local.changed_fields(remote)?;
        if direct.is_empty() {
            return Ok(Resolution::Unchanged);
        }

        // Classify each differing field against the base.
        let (disputed, remote_only) = match base {
            Some(base) => {
                let local_changed = base.changed_fields(local)?;
                let remote_changed = base.changed_fields(remote)?;
                let mut disputed = Vec::new();
                let mut remote_only = Vec::new();
                for field in &direct {
                    let in_local = local_changed.contains(field);
                    let in_remote = remote_changed.contains(field);
                    if in_local && in_remote {
                        disputed.push(*field);
                    } else if in_remote || !in_local {
                        remote_only.push(*field);
                    }
                    // Fields only the local side changed stay local.
                }
                (disputed, remote_only)
            }
            None => (direct.clone(), Vec::new()),
        };

        let table = local.table();

        if disputed.is_empty() {
            let merged = local.merged_with(remote, &remote_only)?;
            return Ok(Resolution::Merged(merged));
        }

        let pattern_key = PatternStore::shape_key(table, &disputed);
        let disputed_strings: Vec<String> = disputed.iter().map(|f| f.to_string()).collect();

        // Safety fields are checked before any pattern lookup so a
        // learned pattern can never flip them to auto.
        let safety = table.safety_fields();
        if disputed.iter().any(|f| safety.contains(f)) {
            warn!(
                record = %local.id(),
                table = %table,
                fields = ?disputed,
                "conflict touches clinical-safety fields, flagging for manual review"
            );
            self.patterns
                .record(&pattern_key, ResolutionStrategy::Manual, now);
            let mut conflict = Conflict::manual(
                table,
                local.id(),
                local.clone(),
                remote.clone(),
                disputed_strings,
                now,
            );
            conflict.pattern_key = Some(pattern_key);
            return Ok(Resolution::NeedsManual { conflict });
        }

        let strategy = match self.patterns.lookup(&pattern_key) {
            Some(entry) if entry.pinned || entry.occurrences >= self.confidence_threshold => {
                entry.strategy
            }
            _ => self.default_strategy,
        };

        let remote_wins = match strategy {
            ResolutionStrategy::Manual => {
                self.patterns
                    .record(&pattern_key, ResolutionStrategy::Manual, now);
                let mut conflict = Conflict::manual(
                    table,
                    local.id(),
                    local.clone(),
                    remote.clone(),
                    disputed_strings,
                    now,
                );
                conflict.pattern_key = Some(pattern_key);
                return Ok(Resolution::NeedsManual { conflict });
            }
            ResolutionStrategy::PreferSqlServer => remote_side == StoreSide::SqlServer,
            ResolutionStrategy::PreferPostgres => remote_side == StoreSide::Postgres,
            ResolutionStrategy::LastWriterWins | ResolutionStrategy::FieldMerge => {
                match remote.updated_at().cmp(&local.updated_at()) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    // Exact tie: Postgres is the system of record.
                    std::cmp::Ordering::Equal => remote_side == StoreSide::Postgres,
                }
            }
        };
        let strategy_used = if matches!(strategy, ResolutionStrategy::FieldMerge) {
            ResolutionStrategy::LastWriterWins
        } else {
            strategy
        };

        // Non-disputed changes from both sides are kept either way;
        // disputed fields come from the winning side.
        let resolved = if remote_wins {
            let mut take: Vec<&str> = remote_only.clone();
            take.extend(disputed.iter().copied());
            local.merged_with(remote, &take)?
        } else {
            local.merged_with(remote, &remote_only)?
        };

        info!(
            record = %local.id(),
            table = %table,
            fields = ?disputed,
            strategy = ?strategy_used,
            remote_wins,
            "conflict auto-resolved"
        );

        self.patterns.record(&pattern_key, strategy_used, now);
        let mut conflict = Conflict::auto_resolved(
            table,
            local.id(),
            local.clone(),
            remote.clone(),
            disputed_strings,
            strategy_used,
            resolved.clone(),
            now,
        );
        conflict.pattern_key = Some(pattern_key);

        Ok(Resolution::AutoResolved { resolved, conflict })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gesden_sync_protocol::{PatientRecord, ResolvedBy, SyncTable};
    use proptest::prelude::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn patient(
        telefono: Option<&str>,
        direccion: Option<&str>,
        alergias: &[&str],
        secs: i64,
    ) -> RecordPayload {
        let mut p = PatientRecord::new("p-1", "Ana", "García", ts(secs));
        p.telefono = telefono.map(String::from);
        p.direccion = direccion.map(String::from);
        p.alergias = alergias.iter().map(|s| s.to_string()).collect();
        RecordPayload::Pacientes(p)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(&EngineConfig::new("journal.jsonl"))
    }

    #[test]
    fn identical_data_is_unchanged() {
        let r = resolver();
        let a = patient(Some("600111222"), None, &[], 10);
        let b = patient(Some("600111222"), None, &[], 99);

        let res = r
            .resolve(None, &a, &b, StoreSide::SqlServer, ts(100))
            .unwrap();
        assert!(matches!(res, Resolution::Unchanged));
    }

    #[test]
    fn disjoint_changes_merge_without_conflict() {
        let r = resolver();
        let base = patient(Some("600111222"), Some("Calle Mayor 1"), &[], 0);
        // Store A changed the phone at T1, store B the address at T2.
        let remote = patient(Some("600999888"), Some("Calle Mayor 1"), &[], 100);
        let local = patient(Some("600111222"), Some("Avenida Sol 5"), &[], 200);

        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::SqlServer,
                ts(300),
            )
            .unwrap();

        match res {
            Resolution::Merged(RecordPayload::Pacientes(p)) => {
                assert_eq!(p.telefono.as_deref(), Some("600999888"));
                assert_eq!(p.direccion.as_deref(), Some("Avenida Sol 5"));
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn same_field_dispute_resolves_by_lww() {
        let r = resolver();
        let base = patient(Some("600111222"), None, &[], 0);
        let local = patient(Some("600333444"), None, &[], 100);
        let remote = patient(Some("600555666"), None, &[], 200);

        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::SqlServer,
                ts(300),
            )
            .unwrap();

        match res {
            Resolution::AutoResolved { resolved, conflict } => {
                match resolved {
                    RecordPayload::Pacientes(p) => {
                        assert_eq!(p.telefono.as_deref(), Some("600555666"))
                    }
                    other => panic!("unexpected payload {other:?}"),
                }
                assert_eq!(conflict.resolved_by, ResolvedBy::Auto);
                assert_eq!(conflict.strategy, ResolutionStrategy::LastWriterWins);
                assert_eq!(conflict.disputed_fields, vec!["telefono"]);
            }
            other => panic!("expected auto resolution, got {other:?}"),
        }
    }

    #[test]
    fn exact_tie_goes_to_postgres() {
        let r = resolver();
        let base = patient(Some("600111222"), None, &[], 0);
        let local = patient(Some("600333444"), None, &[], 100);
        let remote = patient(Some("600555666"), None, &[], 100);

        // Remote comes from Postgres: it wins the tie.
        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::Postgres,
                ts(300),
            )
            .unwrap();
        match res {
            Resolution::AutoResolved { resolved, .. } => match resolved {
                RecordPayload::Pacientes(p) => {
                    assert_eq!(p.telefono.as_deref(), Some("600555666"))
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("expected auto resolution, got {other:?}"),
        }

        // Remote comes from SQL Server: the Postgres local side wins.
        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::SqlServer,
                ts(300),
            )
            .unwrap();
        match res {
            Resolution::AutoResolved { resolved, .. } => match resolved {
                RecordPayload::Pacientes(p) => {
                    assert_eq!(p.telefono.as_deref(), Some("600333444"))
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("expected auto resolution, got {other:?}"),
        }
    }

    #[test]
    fn safety_fields_always_go_to_manual_review() {
        let r = resolver();
        let base = patient(None, None, &["penicilina"], 0);
        let local = patient(None, None, &["penicilina", "ibuprofeno"], 100);
        let remote = patient(None, None, &[], 200);

        // Repeat the same shape well past the confidence threshold;
        // it must never flip to auto.
        for i in 0..10 {
            let res = r
                .resolve(
                    Some(&base),
                    &local,
                    &remote,
                    StoreSide::SqlServer,
                    ts(300 + i),
                )
                .unwrap();
            match res {
                Resolution::NeedsManual { conflict } => {
                    assert_eq!(conflict.resolved_by, ResolvedBy::Manual);
                    assert!(conflict.touches_safety_fields());
                }
                other => panic!("expected manual, got {other:?}"),
            }
        }
    }

    #[test]
    fn pinned_manual_pattern_blocks_auto_resolution() {
        let r = resolver();
        let key = PatternStore::shape_key(SyncTable::Pacientes, &["telefono"]);
        r.patterns().pin(&key, ResolutionStrategy::Manual, ts(0));

        let base = patient(Some("600111222"), None, &[], 0);
        let local = patient(Some("600333444"), None, &[], 100);
        let remote = patient(Some("600555666"), None, &[], 200);

        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::SqlServer,
                ts(300),
            )
            .unwrap();
        assert!(matches!(res, Resolution::NeedsManual { .. }));
    }

    #[test]
    fn pattern_confidence_promotes_learned_strategy() {
        let r = resolver();
        let key = PatternStore::shape_key(SyncTable::Pacientes, &["telefono"]);
        for i in 0..3 {
            r.patterns()
                .record(&key, ResolutionStrategy::PreferSqlServer, ts(i));
        }

        let base = patient(Some("600111222"), None, &[], 0);
        let local = patient(Some("600333444"), None, &[], 500);
        // Remote is older but comes from SQL Server, which the learned
        // pattern prefers.
        let remote = patient(Some("600555666"), None, &[], 100);

        let res = r
            .resolve(
                Some(&base),
                &local,
                &remote,
                StoreSide::SqlServer,
                ts(600),
            )
            .unwrap();
        match res {
            Resolution::AutoResolved { resolved, conflict } => {
                match resolved {
                    RecordPayload::Pacientes(p) => {
                        assert_eq!(p.telefono.as_deref(), Some("600555666"))
                    }
                    other => panic!("unexpected payload {other:?}"),
                }
                assert_eq!(conflict.strategy, ResolutionStrategy::PreferSqlServer);
            }
            other => panic!("expected auto resolution, got {other:?}"),
        }
    }

    fn open_journal(path: &std::path::Path) -> (Arc<Journal>, crate::journal::JournalState) {
        let (journal, state) = Journal::open(path).unwrap();
        (Arc::new(journal), state)
    }

    #[test]
    fn conflict_log_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = open_journal(&dir.path().join("journal.jsonl"));
        let log = ConflictLog::new(journal);
        log.record_merged();
        log.record_merged();

        let base = patient(Some("a"), None, &[], 0);
        let c = Conflict::manual(
            SyncTable::Pacientes,
            "p-1",
            base.clone(),
            base,
            vec!["telefono".into()],
            ts(1),
        );
        let id = c.id;
        log.record_manual(c).unwrap();

        let summary = log.summary();
        assert_eq!(summary.merged, 2);
        assert_eq!(summary.pending_manual, 1);

        assert!(log.archive_pending(id).unwrap().is_some());
        assert_eq!(log.summary().pending_manual, 0);
    }

    #[test]
    fn pending_manual_conflicts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let base = patient(Some("a"), None, &[], 0);
        let c = Conflict::manual(
            SyncTable::Pacientes,
            "p-1",
            base.clone(),
            base,
            vec!["telefono".into()],
            ts(1),
        );
        let id = c.id;

        {
            let (journal, _) = open_journal(&path);
            let log = ConflictLog::new(journal);
            log.record_manual(c).unwrap();
        }

        let (journal, state) = open_journal(&path);
        let log = ConflictLog::recover(journal, state.pending_conflicts);
        assert_eq!(log.summary().pending_manual, 1);
        assert_eq!(log.pending()[0].id, id);

        // Archiving it is journaled too.
        assert!(log.archive_pending(id).unwrap().is_some());
        drop(log);

        let (_journal, state) = open_journal(&path);
        assert!(state.pending_conflicts.is_empty());
    }

    proptest! {
        // Same inputs, same pattern state: same winner, every time.
        #[test]
        fn resolution_is_deterministic(
            local_ts in 1i64..10_000,
            remote_ts in 1i64..10_000,
            local_phone in "[0-9]{9}",
            remote_phone in "[0-9]{9}",
        ) {
            prop_assume!(local_phone != remote_phone);

            let base = patient(Some("000000000"), None, &[], 0);
            let local = patient(Some(&local_phone), None, &[], local_ts);
            let remote = patient(Some(&remote_phone), None, &[], remote_ts);

            let winner_phone = |res: Resolution| match res {
                Resolution::AutoResolved { resolved: RecordPayload::Pacientes(p), .. } => p.telefono,
                other => panic!("expected auto resolution, got {other:?}"),
            };

            let first = winner_phone(resolver().resolve(
                Some(&base), &local,
                &remote, StoreSide::SqlServer, ts(20_000),
            ).unwrap());
            let second = winner_phone(resolver().resolve(
                Some(&base), &local,
                &remote, StoreSide::SqlServer, ts(20_000),
            ).unwrap());

            prop_assert_eq!(first.clone(), second);

            // And the winner is the later writer (tie: Postgres-side local).
            if remote_ts > local_ts {
                prop_assert_eq!(first, Some(remote_phone));
            } else {
                prop_assert_eq!(first, Some(local_phone));
            }
        }
    }
}
