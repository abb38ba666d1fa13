//! Dialog state and the bounded dialog table.
//!
//! Grounded on `original_source/WiPhone/tinySIP.h`'s `Dialog`/`DialogTable`
//! classes and spec §4.4. The teacher's `dialog/dialog.rs` models dialog
//! lifecycle the same three-state way (early/confirmed/terminated); this
//! keeps that shape but swaps the teacher's `DashMap`/async locking for a
//! plain `Vec` scan, matching the single-threaded `poll()` model (spec §5)
//! and the original's fixed small table.

use crate::hash::dialog_id_hash;
use crate::route::RouteSet;

/// Maximum number of simultaneously tracked dialogs (spec §4.4), matching
/// `tinySIP.h`'s `MAX_DIALOGS`.
pub const MAX_DIALOGS: usize = 32;

/// A SIP dialog (RFC 3261 §12), identified by Call-ID + local/remote tags.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    id_hash: u32,

    pub local_cseq: u32,
    pub remote_cseq: u32,

    pub local_uri: String,
    pub remote_uri: String,
    pub remote_target: String,
    pub route_set: RouteSet,

    /// The Via branch of the original INVITE, kept so a CANCEL can reuse
    /// it verbatim (RFC 3261 §9: CANCEL's top Via must match the INVITE
    /// it cancels).
    pub invite_branch: String,

    pub secure: bool,
    pub early: bool,
    pub confirmed: bool,
    pub terminated: bool,
    pub accepted: bool,

    pub ms_last_activity: u64,
}

impl Dialog {
    /// Creates a new early dialog from a Call-ID and local/remote tags
    /// (the remote tag may be empty until a response/ACK supplies it).
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str, local_uri: &str, remote_uri: &str, now_ms: u64) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
            id_hash: dialog_id_hash(call_id, local_tag, remote_tag),
            local_cseq: 0,
            remote_cseq: 0,
            local_uri: local_uri.to_string(),
            remote_uri: remote_uri.to_string(),
            remote_target: remote_uri.to_string(),
            route_set: RouteSet::new(),
            invite_branch: String::new(),
            secure: false,
            early: true,
            confirmed: false,
            terminated: false,
            accepted: false,
            ms_last_activity: now_ms,
        }
    }

    /// Recomputes the id hash; call after learning a remote tag that was
    /// unknown at construction time (UAC early dialogs, spec §4.4).
    pub fn set_remote_tag(&mut self, remote_tag: &str) {
        self.remote_tag = remote_tag.to_string();
        self.id_hash = dialog_id_hash(&self.call_id, &self.local_tag, &self.remote_tag);
    }

    pub fn id_hash(&self) -> u32 {
        self.id_hash
    }

    pub fn matches(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> bool {
        self.call_id == call_id && self.local_tag == local_tag && self.remote_tag == remote_tag
    }

    pub fn confirm(&mut self, now_ms: u64) {
        self.early = false;
        self.confirmed = true;
        self.ms_last_activity = now_ms;
    }

    pub fn terminate(&mut self, now_ms: u64) {
        self.terminated = true;
        self.ms_last_activity = now_ms;
    }

    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }
}

/// A fixed-capacity table of active dialogs, with hash-assisted lookup and
/// oldest-terminated-first eviction (spec §4.4).
#[derive(Debug, Default)]
pub struct DialogTable {
    dialogs: Vec<Dialog>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self { dialogs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Finds an existing dialog by identity, using the 32-bit hash as a
    /// fast-path filter before the exact string comparison.
    pub fn find(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<&Dialog> {
        let h = dialog_id_hash(call_id, local_tag, remote_tag);
        self.dialogs
            .iter()
            .find(|d| d.id_hash() == h && d.matches(call_id, local_tag, remote_tag))
    }

    pub fn find_mut(&mut self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<&mut Dialog> {
        let h = dialog_id_hash(call_id, local_tag, remote_tag);
        self.dialogs
            .iter_mut()
            .find(|d| d.id_hash() == h && d.matches(call_id, local_tag, remote_tag))
    }

    /// Finds a dialog matching `call_id`/`local_tag` regardless of remote
    /// tag, for in-dialog requests arriving before the remote tag is known
    /// to the caller (e.g. matching a CANCEL against an INVITE's dialog).
    pub fn find_by_call_and_local_tag(&self, call_id: &str, local_tag: &str) -> Option<&Dialog> {
        self.dialogs.iter().find(|d| d.call_id == call_id && d.local_tag == local_tag)
    }

    pub fn find_by_call_and_local_tag_mut(&mut self, call_id: &str, local_tag: &str) -> Option<&mut Dialog> {
        self.dialogs.iter_mut().find(|d| d.call_id == call_id && d.local_tag == local_tag)
    }

    /// Inserts `dialog`, evicting to make room if the table is full: the
    /// least-recently-active terminated dialog first, or, if none is
    /// terminated, the least-recently-active dialog of any state (spec
    /// §4.4). Always succeeds.
    pub fn insert(&mut self, dialog: Dialog) -> &mut Dialog {
        if self.dialogs.len() >= MAX_DIALOGS {
            let victim = self
                .dialogs
                .iter()
                .enumerate()
                .filter(|(_, d)| d.terminated)
                .min_by_key(|(_, d)| d.ms_last_activity)
                .map(|(i, _)| i)
                .or_else(|| self.dialogs.iter().enumerate().min_by_key(|(_, d)| d.ms_last_activity).map(|(i, _)| i));
            if let Some(i) = victim {
                self.dialogs.remove(i);
            }
        }
        self.dialogs.push(dialog);
        self.dialogs.last_mut().expect("just pushed")
    }

    /// Removes all terminated dialogs (periodic housekeeping during
    /// `poll()`).
    pub fn reap_terminated(&mut self) {
        self.dialogs.retain(|d| !d.terminated);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dialog> {
        self.dialogs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Dialog> {
        self.dialogs.iter_mut()
    }
}
