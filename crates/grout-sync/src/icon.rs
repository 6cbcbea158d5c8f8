//! Sync status token shown in the UI

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncIcon {
    Syncing,
    Synced,
    Alert,
}

impl SyncIcon {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncIcon::Syncing => "syncing",
            SyncIcon::Synced => "synced",
            SyncIcon::Alert => "alert",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SyncIcon::Syncing => 1,
            SyncIcon::Synced => 2,
            SyncIcon::Alert => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(SyncIcon::Syncing),
            2 => Some(SyncIcon::Synced),
            3 => Some(SyncIcon::Alert),
            _ => None,
        }
    }
}

/// Atomic slot holding the current icon; empty before the first sync
#[derive(Debug, Default)]
pub(crate) struct IconSlot(AtomicU8);

impl IconSlot {
    pub(crate) fn set(&self, icon: SyncIcon) {
        self.0.store(icon.to_u8(), Ordering::SeqCst);
    }

    pub(crate) fn restore(&self, icon: Option<SyncIcon>) {
        self.0.store(icon.map_or(0, SyncIcon::to_u8), Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> Option<SyncIcon> {
        SyncIcon::from_u8(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_slot() {
        let slot = IconSlot::default();
        assert_eq!(slot.get(), None);

        slot.set(SyncIcon::Alert);
        assert_eq!(slot.get(), Some(SyncIcon::Alert));

        slot.restore(None);
        assert_eq!(slot.get(), None);
    }
}
