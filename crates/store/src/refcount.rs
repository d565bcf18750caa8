//! The reference-count state machine: increments, close detection,
//! garbage collection, and read-reference scavenging.

use crate::{ops::Store, Error, Notifications, Result};
use codec::{DataType, DatumId, Value};
use proto::Refc;
use std::collections::HashSet;

/// A scavenge request: when garbage collection is about to release the
/// datum, transfer up to one read reference per embedded referand to
/// the caller instead of releasing it. `subscript` narrows the
/// transfer to referands embedded under one container entry or struct
/// field.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scavenge<'a> {
    pub subscript: Option<&'a [u8]>,
    pub refcounts: Refc,
}

impl Store {
    /// Apply a reference-count change to `id`, collecting close
    /// notifications and any transitive effects into `notifs`.
    pub fn refcount_incr(
        &mut self,
        id: DatumId,
        change: Refc,
        notifs: &mut Notifications,
    ) -> Result<()> {
        self.refcount_impl(id, change, None, notifs)?;
        Ok(())
    }

    /// As [`Store::refcount_incr`], but when the change garbage-collects
    /// the datum, scavenge read references per `scav` instead of
    /// releasing them. Returns whether collection (and so scavenging)
    /// happened: when it does not, no change is applied at all and the
    /// caller must fall back to separate increments and decrements.
    pub(crate) fn refcount_incr_scavenge(
        &mut self,
        id: DatumId,
        change: Refc,
        scav: Scavenge<'_>,
        notifs: &mut Notifications,
    ) -> Result<bool> {
        self.refcount_impl(id, change, Some(scav), notifs)
    }

    pub(crate) fn refcount_impl(
        &mut self,
        id: DatumId,
        change: Refc,
        scav: Option<Scavenge<'_>>,
        notifs: &mut Notifications,
    ) -> Result<bool> {
        let read_enabled = self.read_refcount_enabled;

        // First stage: validate and apply the count changes, capturing
        // any close work to run once the datum borrow ends.
        let (closed, release_write_referands) = {
            let datum = self.datums.get_mut(&id).ok_or(Error::NotFound(id))?;

            // Read-count effects are dropped when read refcounting is
            // disabled or the datum is permanent.
            let read_incr = if !read_enabled || datum.permanent {
                0
            } else {
                change.read
            };
            let write_incr = change.write;

            let will_collect = !datum.permanent
                && datum.read_refcount + read_incr <= 0
                && datum.write_refcount + write_incr <= 0;

            if let Some(scav) = &scav {
                // A scavenging caller only proceeds when collection will
                // happen; otherwise there is a window in which the datum
                // could be collected before the referands gain their own
                // counts.
                debug_assert!(scav.refcounts.read >= 0 && scav.refcounts.write >= 0);
                if !will_collect {
                    return Ok(false);
                }
            }

            if read_incr != 0 {
                if datum.read_refcount <= 0 || datum.read_refcount + read_incr < 0 {
                    return Err(Error::RefcountNegative(id));
                }
                datum.read_refcount += read_incr;
                tracing::trace!(%id, read_refcount = datum.read_refcount, "read refcount");
            }

            if write_incr != 0 {
                if datum.write_refcount <= 0 || datum.write_refcount + write_incr < 0 {
                    return Err(Error::RefcountNegative(id));
                }
                datum.write_refcount += write_incr;
                tracing::trace!(%id, write_refcount = datum.write_refcount, "write refcount");
            }

            if write_incr != 0 && datum.write_refcount == 0 {
                let ranks = datum.drain_listeners();
                tracing::debug!(%id, listeners = ranks.len(), "datum closed");

                let mut referands = Vec::new();
                if datum.release_write_refs {
                    if let Some(value) = &datum.value {
                        value.referands(&mut referands);
                    }
                }
                (Some(ranks), referands)
            } else {
                (None, Vec::new())
            }
        };

        if let Some(ranks) = closed {
            notifs.push_close(id, ranks);
        }
        if !release_write_referands.is_empty() {
            self.apply_referand_changes(&release_write_referands, Refc::new(0, -1), notifs)?;
        }

        let datum = self.datums.get(&id).ok_or(Error::NotFound(id))?;
        if datum.read_refcount <= 0 && datum.write_refcount <= 0 && !datum.permanent {
            self.collect(id, scav, notifs)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove `id` and release everything its value references.
    fn collect(
        &mut self,
        id: DatumId,
        scav: Option<Scavenge<'_>>,
        notifs: &mut Notifications,
    ) -> Result<()> {
        let datum = self.datums.remove(&id).expect("caller verified presence");
        tracing::debug!(%id, "collecting datum");

        if !datum.listeners.is_empty() {
            return Err(Error::Invalid("collected a datum that still has listeners"));
        }
        self.locked.remove(&id);

        let Some(value) = datum.value else {
            return Ok(());
        };

        // Partition referands into those eligible for scavenging and
        // those released normally.
        let mut eligible = Vec::new();
        let mut normal = Vec::new();
        match &scav {
            None => value.referands(&mut normal),
            Some(scav) if scav.refcounts.read <= 0 => value.referands(&mut normal),
            Some(scav) => match (&value, scav.subscript) {
                (Value::Container(c), Some(subscript)) => {
                    for (key, cell) in &c.members {
                        if c.key_type == DataType::Ref {
                            if let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) {
                                normal.push(DatumId(i64::from_le_bytes(bytes)));
                            }
                        }
                        let Some(member) = cell else { continue };
                        if key.as_ref() == subscript {
                            member.referands(&mut eligible);
                        } else {
                            member.referands(&mut normal);
                        }
                    }
                }
                (Value::Struct(s), Some(subscript)) => {
                    let index = self
                        .registry
                        .field_index(s.struct_type, &crate::subscript_repr(subscript))
                        .ok();
                    for (i, field) in s.fields.iter().enumerate() {
                        let Some(field) = field else { continue };
                        if Some(i) == index {
                            field.referands(&mut eligible);
                        } else {
                            field.referands(&mut normal);
                        }
                    }
                }
                _ => value.referands(&mut eligible),
            },
        }

        // At most one read reference per referand target is transferred
        // to the caller; every other occurrence is released.
        let mut transferred = HashSet::new();
        for target in eligible {
            if transferred.insert(target) {
                tracing::trace!(%id, %target, "scavenged read reference");
                continue;
            }
            normal.push(target);
        }

        self.apply_referand_changes(&normal, Refc::new(-1, 0), notifs)
    }

    /// Route a per-referand change: local shards recurse, remote shards
    /// are deferred for the server to forward.
    pub(crate) fn apply_referand_changes(
        &mut self,
        ids: &[DatumId],
        change: Refc,
        notifs: &mut Notifications,
    ) -> Result<()> {
        if change.write == 0 && !self.read_refcount_enabled {
            return Ok(());
        }
        for &id in ids {
            if self.owns(id) {
                self.refcount_incr(id, change, notifs)?;
            } else {
                notifs.push_remote(id, change);
            }
        }
        Ok(())
    }
}
