//! Downstream sync destinations and the records each one consumes.
//!
//! Each destination is synced by exactly one job of the same name, so the
//! job-level advisory lock is also the per-destination dispatch lock.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::event::EventKind;

/// What a destination tracks its sync state on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
  /// A boolean flag in the profile extension map, re-armed by merges.
  Profile,
  /// One `event_syncs` row per synced event.
  Event,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  AsRefStr,
  EnumString,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Destination {
  /// Starts a follow-up flow in the flow engine for TB-check contacts.
  TbFollowup,
  /// Bulk row upload to the data warehouse, one table per event kind.
  Warehouse,
  /// Pushes the latest triage risk onto the messaging-platform profile.
  MessagingProfile,
}

impl Destination {
  /// The job name that syncs this destination.
  pub fn job_name(self) -> &'static str {
    match self {
      Self::TbFollowup => "tb_followup",
      Self::Warehouse => "warehouse",
      Self::MessagingProfile => "messaging_profile",
    }
  }

  pub fn scope(self) -> SyncScope {
    match self {
      Self::TbFollowup => SyncScope::Profile,
      Self::Warehouse | Self::MessagingProfile => SyncScope::Event,
    }
  }

  /// Extension-map key holding the profile-level flag.
  pub fn profile_flag(self) -> Option<&'static str> {
    match self {
      Self::TbFollowup => Some("synced_to_tb_destination"),
      Self::Warehouse | Self::MessagingProfile => None,
    }
  }

  /// Event kinds whose merge resets this destination's profile flag to
  /// `false`.
  pub fn rearmed_by(self) -> &'static [EventKind] {
    match self {
      Self::TbFollowup => &[EventKind::TbCheck],
      Self::Warehouse | Self::MessagingProfile => &[],
    }
  }

  /// Event kinds an event-scoped destination consumes.
  pub fn event_kinds(self) -> &'static [EventKind] {
    match self {
      Self::TbFollowup => &[],
      Self::Warehouse => &[
        EventKind::Triage,
        EventKind::TbCheck,
        EventKind::SelfSwabTest,
        EventKind::VaccineRegistration,
      ],
      Self::MessagingProfile => &[EventKind::Triage],
    }
  }
}
