//! Apply a schedule to a run of commits.
//!
//! The rewrite is a fold over the commits, oldest first, carrying the id of
//! the previously written replacement as the parent of the next one. Nothing
//! visible changes until the very end, when the branch is moved in a single
//! compare-and-swap. A failure anywhere before that leaves the branch where
//! it was; the only residue is unreferenced objects.

use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDateTime, Offset, TimeZone, Timelike,
};
use thiserror::Error;

use crate::commit::{CommitRecord, IdentityOverride, short};
use crate::git::{self, CommitRange, HeadRef, Repository};
use crate::schedule::Timestamp;

/// Inputs to [`rewrite`].
#[derive(Debug, Clone)]
pub struct RewriteRequest<'a> {
    /// Commits to rewrite, oldest first, ending at `HEAD`.
    pub commit_ids: &'a [String],
    /// One timestamp per commit, in the same order.
    pub timestamps: &'a [Timestamp],
    pub identity: Option<&'a IdentityOverride>,
    /// Name of a branch to leave at the old head before touching anything.
    pub backup: Option<&'a str>,
}

/// One commit has been written.
#[derive(Debug, Clone)]
pub struct Progress<'a> {
    /// Zero-based position in the run.
    pub index: usize,
    pub total: usize,
    pub old: &'a str,
    pub new: &'a str,
    pub when: DateTime<FixedOffset>,
}

/// Outcome of a successful rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub head: String,
    pub previous_head: String,
    pub backup: Option<String>,
    /// `(old id, new id)` pairs, oldest first.
    pub commits: Vec<(String, String)>,
}

/// Resolve `range` to commit ids, oldest first.
pub fn select_commits(repo: &impl Repository, range: CommitRange) -> Result<Vec<String>, Error> {
    let ids = repo.commit_ids(range)?;
    if ids.is_empty() {
        return Err(Error::InvalidRange("the repository has no commits".to_string()));
    }
    if let CommitRange::Tail(wanted) = range {
        if wanted > ids.len() {
            return Err(Error::InvalidRange(format!(
                "asked for {wanted} commits but HEAD only has {} in its history",
                ids.len()
            )));
        }
    }
    Ok(ids)
}

/// Rewrite `request.commit_ids` onto `request.timestamps` and move the branch.
///
/// `on_progress` is called once per written commit.
pub fn rewrite(
    repo: &impl Repository,
    request: &RewriteRequest<'_>,
    mut on_progress: impl FnMut(&Progress<'_>),
) -> Result<Rewritten, Error> {
    let ids = request.commit_ids;
    if ids.is_empty() {
        return Err(Error::InvalidRange("no commits to rewrite".to_string()));
    }
    if ids.len() != request.timestamps.len() {
        return Err(Error::InvalidRange(format!(
            "{} commits but {} timestamps",
            ids.len(),
            request.timestamps.len()
        )));
    }

    let head_ref = repo.head_ref()?;
    let head = repo.head()?;

    let records: Vec<CommitRecord> = ids
        .iter()
        .map(|id| repo.read_commit(id))
        .collect::<Result<_, _>>()?;
    check_chain(&records, &head)?;

    let backup = match request.backup {
        Some(name) => Some(create_backup(repo, name, &head)?),
        None => None,
    };

    let total = records.len();
    let mut new_parent = records[0].parents.first().cloned();
    let mut commits = Vec::with_capacity(total);

    for (index, (record, stamp)) in records.iter().zip(request.timestamps).enumerate() {
        let when = localize(*stamp);
        let replacement = record.retimed(when, request.identity, new_parent.take());
        let new_id = repo.write_commit(&replacement)?;

        tracing::info!(old = %record.short_id(), new = %short(&new_id), %when, "rewrote commit");
        on_progress(&Progress {
            index,
            total,
            old: &record.id,
            new: &new_id,
            when,
        });

        commits.push((record.id.clone(), new_id.clone()));
        new_parent = Some(new_id);
    }

    let new_head =
        new_parent.ok_or_else(|| Error::InvalidRange("no commits to rewrite".to_string()))?;
    repo.update_ref(head_ref.refname(), &new_head, &head)?;

    Ok(Rewritten {
        head: new_head,
        previous_head: head,
        backup,
        commits,
    })
}

/// The run must be a straight line of single-parent commits ending at `head`.
fn check_chain(records: &[CommitRecord], head: &str) -> Result<(), Error> {
    let mut previous: Option<&str> = None;
    for record in records {
        if record.parents.len() > 1 {
            return Err(Error::InvalidRange(format!(
                "commit {} is a merge; merge commits cannot be re-dated",
                record.short_id()
            )));
        }
        if let Some(previous) = previous {
            if record.parents.first().map(String::as_str) != Some(previous) {
                return Err(Error::InvalidRange(format!(
                    "commit {} is not a child of {}",
                    record.short_id(),
                    short(previous)
                )));
            }
        }
        previous = Some(record.id.as_str());
    }

    match previous {
        Some(last) if last == head => Ok(()),
        Some(last) => Err(Error::InvalidRange(format!(
            "range ends at {} but HEAD is {}",
            short(last),
            short(head)
        ))),
        None => Err(Error::InvalidRange("no commits to rewrite".to_string())),
    }
}

fn create_backup(repo: &impl Repository, name: &str, head: &str) -> Result<String, Error> {
    let backup_err = |source: git::Error| Error::Backup {
        name: name.to_string(),
        source,
    };
    if repo.ref_exists(&format!("refs/heads/{name}")) {
        return Err(backup_err(git::Error::Failed("branch already exists".to_string())));
    }
    repo.create_branch(name, head).map_err(backup_err)?;
    tracing::info!(branch = %name, head = %short(head), "created backup branch");
    Ok(name.to_string())
}

/// `backup-<branch>-<YYYYmmdd-HHMMSS>`.
pub fn backup_name(head_ref: &HeadRef, now: NaiveDateTime) -> String {
    format!("backup-{}-{}", head_ref.short_name(), now.format("%Y%m%d-%H%M%S"))
}

/// Attach the local zone's offset to a wall-clock time.
///
/// An ambiguous time (clocks going back) takes the earlier instant. A time
/// that does not exist (clocks going forward) becomes the transition instant,
/// written with the offset in force just before it. Every time in the same gap
/// therefore lands on one instant that reads as the start of the gap, which
/// keeps a sorted schedule sorted and inside the working day.
pub fn localize(stamp: Timestamp) -> DateTime<FixedOffset> {
    localize_in(&Local, stamp)
}

fn localize_in<Tz: TimeZone>(zone: &Tz, stamp: Timestamp) -> DateTime<FixedOffset> {
    if let Some(when) = resolve(zone, stamp) {
        return when;
    }

    // Transitions fall on whole minutes; the first wall minute that exists
    // again is the end of the gap.
    let mut wall = stamp
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(stamp);
    let transition = loop {
        wall += Duration::minutes(1);
        if let Some(when) = resolve(zone, wall) {
            break when;
        }
    };

    let before = transition.naive_utc() - Duration::seconds(1);
    let offset = zone.offset_from_utc_datetime(&before).fix();
    transition.with_timezone(&offset)
}

fn resolve<Tz: TimeZone>(zone: &Tz, wall: Timestamp) -> Option<DateTime<FixedOffset>> {
    match zone.from_local_datetime(&wall) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => Some(t.fixed_offset()),
        LocalResult::None => None,
    }
}

/// One line of the date assignment plan shown before rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub id: String,
    pub subject: String,
    pub original: DateTime<FixedOffset>,
    pub new: Timestamp,
}

/// Pair each commit with the timestamp it will receive.
pub fn plan(records: &[CommitRecord], timestamps: &[Timestamp]) -> Vec<PlanEntry> {
    records
        .iter()
        .zip(timestamps)
        .map(|(record, stamp)| PlanEntry {
            id: record.id.clone(),
            subject: record.subject(),
            original: record.author.when,
            new: *stamp,
        })
        .collect()
}

/// Errors that can occur while rewriting.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid commit range: {0}")]
    InvalidRange(String),

    #[error("failed to create backup branch '{name}'")]
    Backup {
        name: String,
        #[source]
        source: git::Error,
    },

    #[error("git error")]
    Git(#[from] git::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::parse_date;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    /// An in-memory object store with a single branch.
    struct FakeRepo {
        objects: RefCell<BTreeMap<String, CommitRecord>>,
        branches: RefCell<BTreeMap<String, String>>,
        head_branch: String,
        order: Vec<String>,
        fail_write_after: Option<usize>,
        writes: Cell<usize>,
    }

    impl FakeRepo {
        /// A linear history of `n` commits `c0..c{n-1}` on `refs/heads/main`.
        fn linear(n: usize) -> Self {
            let mut objects = BTreeMap::new();
            let mut order = Vec::new();
            let mut parent: Option<String> = None;
            for i in 0..n {
                let id = format!("{i:0>40}");
                let raw = format!(
                    "tree t{i}\n{}author Old Name <old@example.com> {} +0000\n\
                     committer Old Name <old@example.com> {} +0000\n\nmessage {i}\n",
                    parent.as_ref().map(|p| format!("parent {p}\n")).unwrap_or_default(),
                    1_600_000_000 + i,
                    1_600_000_000 + i,
                );
                objects.insert(id.clone(), CommitRecord::parse(&id, raw.as_bytes()).unwrap());
                order.push(id.clone());
                parent = Some(id);
            }

            let mut branches = BTreeMap::new();
            if let Some(head) = parent {
                branches.insert("refs/heads/main".to_string(), head);
            }
            Self {
                objects: RefCell::new(objects),
                branches: RefCell::new(branches),
                head_branch: "refs/heads/main".to_string(),
                order,
                fail_write_after: None,
                writes: Cell::new(0),
            }
        }

        fn branch(&self, name: &str) -> Option<String> {
            self.branches.borrow().get(name).cloned()
        }

        fn commit(&self, id: &str) -> CommitRecord {
            self.objects.borrow()[id].clone()
        }
    }

    impl Repository for FakeRepo {
        fn head(&self) -> Result<String, git::Error> {
            self.branch(&self.head_branch)
                .ok_or_else(|| git::Error::Failed("no HEAD".into()))
        }

        fn head_ref(&self) -> Result<HeadRef, git::Error> {
            Ok(HeadRef::Branch(self.head_branch.clone()))
        }

        fn commit_ids(&self, range: CommitRange) -> Result<Vec<String>, git::Error> {
            let skip = match range {
                CommitRange::Tail(n) => self.order.len().saturating_sub(n),
                CommitRange::All => 0,
            };
            Ok(self.order[skip..].to_vec())
        }

        fn read_commit(&self, id: &str) -> Result<CommitRecord, git::Error> {
            self.objects
                .borrow()
                .get(id)
                .cloned()
                .ok_or_else(|| git::Error::Failed(format!("no object {id}")))
        }

        fn write_commit(&self, record: &CommitRecord) -> Result<String, git::Error> {
            let n = self.writes.get();
            if self.fail_write_after == Some(n) {
                return Err(git::Error::Failed("disk full".into()));
            }
            self.writes.set(n + 1);
            let id = format!("new{n:0>37}");
            let mut stored = record.clone();
            stored.id = id.clone();
            self.objects.borrow_mut().insert(id.clone(), stored);
            Ok(id)
        }

        fn ref_exists(&self, refname: &str) -> bool {
            self.branches.borrow().contains_key(refname)
        }

        fn create_branch(&self, name: &str, target: &str) -> Result<(), git::Error> {
            let refname = format!("refs/heads/{name}");
            if self.ref_exists(&refname) {
                return Err(git::Error::Failed("exists".into()));
            }
            self.branches.borrow_mut().insert(refname, target.to_string());
            Ok(())
        }

        fn update_ref(&self, refname: &str, new: &str, old: &str) -> Result<(), git::Error> {
            let mut branches = self.branches.borrow_mut();
            if branches.get(refname).map(String::as_str) != Some(old) {
                return Err(git::Error::Failed("ref moved".into()));
            }
            branches.insert(refname.to_string(), new.to_string());
            Ok(())
        }
    }

    fn stamps(n: usize) -> Vec<Timestamp> {
        let day = parse_date("2024-01-02").unwrap();
        (0..n)
            .map(|i| day.and_hms_opt(9 + i as u32, 30, 0).unwrap())
            .collect()
    }

    fn run(
        repo: &FakeRepo,
        ids: &[String],
        times: &[Timestamp],
        identity: Option<&IdentityOverride>,
        backup: Option<&str>,
    ) -> Result<Rewritten, Error> {
        let request = RewriteRequest {
            commit_ids: ids,
            timestamps: times,
            identity,
            backup,
        };
        rewrite(repo, &request, |_| {})
    }

    #[test]
    fn rewrites_a_tail_and_moves_the_branch() {
        let repo = FakeRepo::linear(6);
        let ids = select_commits(&repo, CommitRange::Tail(3)).unwrap();
        assert_eq!(ids, repo.order[3..].to_vec());
        let times = stamps(3);

        let done = run(&repo, &ids, &times, None, None).unwrap();

        assert_eq!(repo.branch("refs/heads/main").as_deref(), Some(done.head.as_str()));
        assert_eq!(done.previous_head, repo.order[5]);
        assert_eq!(done.backup, None);

        // The first replacement hangs off the untouched commit below the range.
        let mut expected_parent = Some(repo.order[2].clone());
        for ((old, new), stamp) in done.commits.iter().zip(&times) {
            let before = repo.commit(old);
            let after = repo.commit(new);
            assert_eq!(after.parents.first(), expected_parent.as_ref());
            assert_eq!(after.tree, before.tree);
            assert_eq!(after.message, before.message);
            assert_eq!(after.author.when.naive_local(), *stamp);
            assert_eq!(after.committer.when.naive_local(), *stamp);
            assert_eq!(after.author.name, b"Old Name");
            expected_parent = Some(new.clone());
        }
    }

    #[test]
    fn rewrites_from_the_root() {
        let repo = FakeRepo::linear(4);
        let ids = select_commits(&repo, CommitRange::All).unwrap();
        let done = run(&repo, &ids, &stamps(4), None, None).unwrap();

        let root = repo.commit(&done.commits[0].1);
        assert!(root.parents.is_empty());
        assert_eq!(done.commits.len(), 4);
    }

    #[test]
    fn identity_override_applies_to_every_commit() {
        let repo = FakeRepo::linear(5);
        let ids = select_commits(&repo, CommitRange::Tail(5)).unwrap();
        let identity = IdentityOverride {
            name: Some("John Doe".into()),
            email: Some("john@example.com".into()),
        };

        let done = run(&repo, &ids, &stamps(5), Some(&identity), None).unwrap();

        for (old, new) in &done.commits {
            let before = repo.commit(old);
            let after = repo.commit(new);
            assert_eq!(after.author.name, b"John Doe");
            assert_eq!(after.author.email, b"john@example.com");
            assert_eq!(after.committer.name, b"John Doe");
            assert_eq!(after.committer.email, b"john@example.com");
            assert_eq!(after.tree, before.tree);
            assert_eq!(after.message, before.message);
        }
    }

    #[test]
    fn backup_points_at_the_old_head() {
        let repo = FakeRepo::linear(3);
        let ids = select_commits(&repo, CommitRange::Tail(2)).unwrap();

        let done = run(&repo, &ids, &stamps(2), None, Some("backup-main-20240102-090000")).unwrap();

        let backup = done.backup.unwrap();
        assert_eq!(backup, "backup-main-20240102-090000");
        assert_eq!(repo.branch(&format!("refs/heads/{backup}")), Some(repo.order[2].clone()));
    }

    #[test]
    fn failed_write_leaves_the_branch_alone() {
        let mut repo = FakeRepo::linear(5);
        repo.fail_write_after = Some(2);
        let before = repo.branch("refs/heads/main");
        let ids = select_commits(&repo, CommitRange::Tail(5)).unwrap();

        let mut seen = 0;
        let request = RewriteRequest {
            commit_ids: &ids,
            timestamps: &stamps(5),
            identity: None,
            backup: None,
        };
        let result = rewrite(&repo, &request, |_| seen += 1);

        assert!(matches!(result, Err(Error::Git(_))));
        assert_eq!(seen, 2);
        assert_eq!(repo.branch("refs/heads/main"), before);
    }

    #[test]
    fn backup_collision_aborts_before_writing() {
        let repo = FakeRepo::linear(2);
        let ids = select_commits(&repo, CommitRange::All).unwrap();
        repo.create_branch("backup-main-x", &repo.order[0]).unwrap();

        let result = run(&repo, &ids, &stamps(2), None, Some("backup-main-x"));

        assert!(matches!(result, Err(Error::Backup { .. })));
        assert_eq!(repo.writes.get(), 0);
        assert_eq!(repo.branch("refs/heads/main"), Some(repo.order[1].clone()));
    }

    #[test]
    fn too_many_commits_is_an_invalid_range() {
        let repo = FakeRepo::linear(3);
        assert!(matches!(
            select_commits(&repo, CommitRange::Tail(4)),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            select_commits(&FakeRepo::linear(0), CommitRange::All),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let repo = FakeRepo::linear(3);
        let ids = select_commits(&repo, CommitRange::All).unwrap();
        assert!(matches!(
            run(&repo, &ids, &stamps(2), None, None),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn range_must_end_at_head() {
        let repo = FakeRepo::linear(4);
        let ids = repo.order[..2].to_vec();
        assert!(matches!(
            run(&repo, &ids, &stamps(2), None, None),
            Err(Error::InvalidRange(_))
        ));
        assert_eq!(repo.writes.get(), 0);
    }

    #[test]
    fn gaps_in_the_chain_are_rejected() {
        let repo = FakeRepo::linear(4);
        let ids = vec![repo.order[1].clone(), repo.order[3].clone()];
        assert!(matches!(
            run(&repo, &ids, &stamps(2), None, None),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn merge_commits_are_rejected() {
        let repo = FakeRepo::linear(3);
        let head = repo.order[2].clone();
        repo.objects
            .borrow_mut()
            .get_mut(&head)
            .unwrap()
            .parents
            .push(repo.order[0].clone());
        let ids = select_commits(&repo, CommitRange::Tail(2)).unwrap();

        assert!(matches!(
            run(&repo, &ids, &stamps(2), None, Some("backup-main-x")),
            Err(Error::InvalidRange(_))
        ));
        assert_eq!(repo.branches.borrow().len(), 1, "no backup for a rejected range");
    }

    #[test]
    fn backup_names_use_the_short_branch() {
        let now = parse_date("2024-05-06").unwrap().and_hms_opt(7, 8, 9).unwrap();
        assert_eq!(
            backup_name(&HeadRef::Branch("refs/heads/feature/x".into()), now),
            "backup-feature/x-20240506-070809"
        );
        assert_eq!(backup_name(&HeadRef::Detached, now), "backup-detached-20240506-070809");
    }

    #[test]
    fn localize_keeps_wall_clock_in_a_fixed_zone() {
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        let stamp = parse_date("2024-01-02").unwrap().and_hms_opt(10, 0, 0).unwrap();
        let when = localize_in(&zone, stamp);
        assert_eq!(when.naive_local(), stamp);
        assert_eq!(when.offset().local_minus_utc(), 7200);
    }

    fn at(date: &str, time: &str) -> Timestamp {
        parse_date(date)
            .unwrap()
            .and_time(crate::schedule::parse_time(time).unwrap())
    }

    #[test]
    fn spring_forward_gap_collapses_onto_the_transition() {
        let zone = chrono_tz::America::New_York;
        let day = [
            at("2024-03-10", "01:50"),
            at("2024-03-10", "02:00"),
            at("2024-03-10", "02:20"),
            at("2024-03-10", "02:50"),
            at("2024-03-10", "03:00"),
            at("2024-03-10", "03:05"),
        ];
        let instants: Vec<_> = day.iter().map(|stamp| localize_in(&zone, *stamp)).collect();

        assert!(instants.windows(2).all(|pair| pair[0] <= pair[1]), "{instants:?}");
        assert!(instants.windows(2).all(|pair| pair[0].naive_local() <= pair[1].naive_local()));

        // 07:00 UTC is both 02:00 EST and 03:00 EDT.
        let transition = at("2024-03-10", "07:00");
        for gap in &instants[1..4] {
            assert_eq!(gap.naive_utc(), transition);
            assert_eq!(gap.naive_local(), at("2024-03-10", "02:00"));
            assert_eq!(gap.offset().local_minus_utc(), -5 * 3600);
        }
        assert_eq!(instants[4].offset().local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn gap_times_stay_inside_a_working_day_that_spans_the_gap() {
        let zone = chrono_tz::Europe::Berlin;
        let stamp = at("2024-03-31", "02:20");
        let when = localize_in(&zone, stamp);

        assert!(when.naive_local() <= at("2024-03-31", "02:30"));
        assert!(when.naive_local() >= at("2024-03-31", "01:00"));
        assert_eq!(when.naive_utc(), at("2024-03-31", "01:00"));
    }

    #[test]
    fn ambiguous_times_take_the_earlier_instant() {
        let zone = chrono_tz::America::New_York;
        let when = localize_in(&zone, at("2024-11-03", "01:30"));
        assert_eq!(when.naive_local(), at("2024-11-03", "01:30"));
        assert_eq!(when.offset().local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn plan_pairs_commits_with_new_dates() {
        let repo = FakeRepo::linear(2);
        let records = repo.list_commits(CommitRange::All).unwrap();
        let times = stamps(2);
        let entries = plan(&records, &times);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].subject, "message 1");
        assert_eq!(entries[1].new, times[1]);
        assert_eq!(entries[0].original.timestamp(), 1_600_000_000);
    }
}
