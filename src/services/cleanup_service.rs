//! One-off repairs run at the start of an initial sync.
//!
//! Both are idempotent and gated by markers in the sync metadata table, so
//! they only do work when something changed.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::info;

use super::conversation_service::{participant_hash, ConversationResolver};
use crate::domain::ConversationId;
use crate::storage::queries::{conversations, meta};
use crate::storage::Result;

/// What the cleanup changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Conversations whose identity changed after an alias change.
    pub rehashed: usize,
    /// Conversations merged away.
    pub merged: usize,
    /// Conversations touched by the archive migration.
    pub migrated: usize,
    /// Survivors and rehashed conversations.
    pub touched: Vec<ConversationId>,
}

/// Runs the alias fix-up and the archive migration.
#[derive(Debug, Clone)]
pub struct CleanupService {
    resolver: ConversationResolver,
}

impl CleanupService {
    /// Creates the service for the current account identity.
    pub fn new(resolver: ConversationResolver) -> Self {
        Self { resolver }
    }

    /// Runs every pending repair.
    pub fn run(&self, conn: &Connection) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        self.fix_aliases(conn, &mut report)?;
        self.migrate_archive_flags(conn, &mut report)?;
        Ok(report)
    }

    /// Drops account addresses from stored identities and merges the
    /// conversations that collapse onto the same identity.
    fn fix_aliases(&self, conn: &Connection, report: &mut CleanupReport) -> Result<()> {
        let signature = self.resolver.identity().signature();
        if meta::get(conn, meta::ALIAS_SIGNATURE)?.as_deref() == Some(signature.as_str()) {
            return Ok(());
        }

        let mut groups: BTreeMap<String, Vec<ConversationId>> = BTreeMap::new();
        for conversation in conversations::get_all(conn)? {
            let stored = conversations::participants(conn, &conversation.id)?;
            let owned: Vec<String> = stored
                .iter()
                .filter(|p| self.resolver.identity().owns(p))
                .cloned()
                .collect();
            if !owned.is_empty() {
                conversations::remove_participants(conn, &conversation.id, &owned)?;
            }

            let remaining = self
                .resolver
                .identity_participants(stored.iter().map(String::as_str));
            let thread = match conversation.thread_link_id.clone() {
                Some(thread) => Some(thread),
                None => conversations::first_thread_link(conn, &conversation.id)?,
            };
            let Some(hash) = participant_hash(&remaining, thread.as_ref()) else {
                continue;
            };

            if hash != conversation.participant_hash {
                conversations::set_participant_hash(conn, &conversation.id, &hash)?;
                report.rehashed += 1;
                report.touched.push(conversation.id.clone());
            }
            groups.entry(hash).or_default().push(conversation.id);
        }

        for ids in groups.into_values().filter(|ids| ids.len() > 1) {
            if let Some(winner) = self.resolver.merge(conn, &ids)? {
                report.merged += ids.len() - 1;
                report.touched.retain(|id| !ids.contains(id));
                report.touched.push(winner);
            }
        }

        meta::set(conn, meta::ALIAS_SIGNATURE, &signature)?;
        if report.rehashed > 0 || report.merged > 0 {
            info!(rehashed = report.rehashed, merged = report.merged, "alias fix-up applied");
        }
        Ok(())
    }

    /// Derives every conversation's archive flag from inbox membership once.
    fn migrate_archive_flags(&self, conn: &Connection, report: &mut CleanupReport) -> Result<()> {
        if meta::get_flag(conn, meta::ARCHIVE_MODEL_MIGRATED)? {
            return Ok(());
        }
        for conversation in conversations::get_all(conn)? {
            let rollup = conversations::compute_rollup(conn, &conversation.id)?;
            conversations::apply_rollup(conn, &conversation.id, &rollup)?;
            report.migrated += 1;
        }
        meta::set_flag(conn, meta::ARCHIVE_MODEL_MIGRATED, true)?;
        info!(conversations = report.migrated, "archive flags migrated");
        Ok(())
    }
}
