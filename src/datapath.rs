//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Attach/detach of the (opaque, out-of-scope) datapath program to physical
//! interfaces. The coordinator only ever asks for a named
//! interface to gain or lose one of two program roles:
//!
//!  * the **upstream-direction** program, which forwards upstream→downstream
//!    traffic and is attached to each *internal* (downstream) interface,
//!  * the **downstream-direction** program, which forwards
//!    downstream→upstream traffic and is attached to each *external*
//!    (upstream) interface.
//!
//! Attachment is reference-counted per interface because several downstream
//! interfaces can pair with the same upstream (design §6: "attached once per
//! external interface regardless of how many downstreams pair with it").

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::Error;

/// Capability set for attaching/detaching the two datapath program roles,
/// analogous to [`crate::maps::KernelMap`]'s capability set over a single
/// map (design §9).
pub trait Datapath: std::fmt::Debug + Send {
    fn attach_upstream_direction(&mut self, ifindex: u32, ifname: &str) -> Result<(), Error>;
    fn detach_upstream_direction(&mut self, ifindex: u32, ifname: &str) -> Result<(), Error>;
    fn attach_downstream_direction(&mut self, ifindex: u32, ifname: &str) -> Result<(), Error>;
    fn detach_downstream_direction(&mut self, ifindex: u32, ifname: &str) -> Result<(), Error>;
}

/// A [`Datapath`] that does nothing; used in degraded mode and by tests
/// that only care about the reference-counting logic in
/// [`ProgramAttachments`].
#[derive(Debug, Default)]
pub struct NullDatapath;

impl Datapath for NullDatapath {
    fn attach_upstream_direction(&mut self, _ifindex: u32, _ifname: &str) -> Result<(), Error> {
        Ok(())
    }

    fn detach_upstream_direction(&mut self, _ifindex: u32, _ifname: &str) -> Result<(), Error> {
        Ok(())
    }

    fn attach_downstream_direction(&mut self, _ifindex: u32, _ifname: &str) -> Result<(), Error> {
        Ok(())
    }

    fn detach_downstream_direction(&mut self, _ifindex: u32, _ifname: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Reference-counted bookkeeping of which (downstream, upstream) pairs and
/// per-role interface attachments are currently active, so repeated or
/// overlapping `attach_program`/`detach_program` calls stay idempotent
/// (design §6).
#[derive(Debug, Default)]
pub struct ProgramAttachments {
    pairs: HashSet<(u32, u32)>,
    upstream_direction_refs: HashMap<u32, u32>,
    downstream_direction_refs: HashMap<u32, u32>,
}

/// The outcome of an attach/detach call: which roles newly gained or lost
/// their last reference, i.e. which physical attach/detach syscalls the
/// caller must actually issue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AttachmentEdge {
    pub attach_upstream_direction_on_intf_in: bool,
    pub attach_downstream_direction_on_intf_out: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DetachmentEdge {
    pub detach_upstream_direction_on_intf_in: bool,
    pub detach_downstream_direction_on_intf_out: bool,
}

// ===== impl ProgramAttachments =====

impl ProgramAttachments {
    pub fn new() -> Self {
        ProgramAttachments::default()
    }

    /// Records a new (intf_in, intf_out) pairing. Virtual interfaces (e.g.
    /// IPsec) are skipped entirely and never reach the reference counts
    /// (design §6). Idempotent: re-attaching an already-recorded pair
    /// returns an all-`false` edge.
    pub fn attach(
        &mut self,
        intf_in: u32,
        intf_out: u32,
        intf_in_virtual: bool,
        intf_out_virtual: bool,
    ) -> AttachmentEdge {
        if intf_in_virtual || intf_out_virtual {
            return AttachmentEdge::default();
        }
        if !self.pairs.insert((intf_in, intf_out)) {
            return AttachmentEdge::default();
        }

        let in_refs = self.upstream_direction_refs.entry(intf_in).or_insert(0);
        let attach_in = *in_refs == 0;
        *in_refs += 1;

        let out_refs = self.downstream_direction_refs.entry(intf_out).or_insert(0);
        let attach_out = *out_refs == 0;
        *out_refs += 1;

        AttachmentEdge {
            attach_upstream_direction_on_intf_in: attach_in,
            attach_downstream_direction_on_intf_out: attach_out,
        }
    }

    /// Withdraws a previously recorded pairing, returning which roles lost
    /// their last reference and must be physically detached.
    pub fn detach(&mut self, intf_in: u32, intf_out: u32) -> DetachmentEdge {
        if !self.pairs.remove(&(intf_in, intf_out)) {
            return DetachmentEdge::default();
        }

        let detach_in = match self.upstream_direction_refs.get_mut(&intf_in) {
            Some(refs) if *refs > 0 => {
                *refs -= 1;
                if *refs == 0 {
                    self.upstream_direction_refs.remove(&intf_in);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        let detach_out = match self.downstream_direction_refs.get_mut(&intf_out) {
            Some(refs) if *refs > 0 => {
                *refs -= 1;
                if *refs == 0 {
                    self.downstream_direction_refs.remove(&intf_out);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        DetachmentEdge {
            detach_upstream_direction_on_intf_in: detach_in,
            detach_downstream_direction_on_intf_out: detach_out,
        }
    }
}

/// [`Datapath`] backed by the real kernel program, pinned under
/// `/sys/fs/bpf/<name>` by whatever loaded it (out of scope, design §1).
/// Mirrors [`crate::maps::kernel::BpfMap::open`]'s pin-based attach rather
/// than loading the program itself.
pub mod kernel {
    use std::path::{Path, PathBuf};

    use aya::programs::tc::{SchedClassifier, TcAttachType};
    use aya::programs::Link;

    use super::Datapath;
    use crate::error::Error;

    #[derive(Debug)]
    pub struct BpfDatapath {
        pin_base: PathBuf,
    }

    impl BpfDatapath {
        pub fn new(pin_base: impl AsRef<Path>) -> Self {
            BpfDatapath {
                pin_base: pin_base.as_ref().to_path_buf(),
            }
        }

        fn attach(
            &self,
            prog_name: &str,
            ifname: &str,
            direction: TcAttachType,
        ) -> Result<(), Error> {
            let pin_path = self.pin_base.join(prog_name);
            let mut prog = SchedClassifier::from_pin(&pin_path)
                .map_err(|error| Error::Netlink(std::io::Error::other(error.to_string())))?;
            prog.attach(ifname, direction)
                .map(|_link| ())
                .map_err(|error| Error::Netlink(std::io::Error::other(error.to_string())))
        }
    }

    impl Datapath for BpfDatapath {
        fn attach_upstream_direction(
            &mut self,
            _ifindex: u32,
            ifname: &str,
        ) -> Result<(), Error> {
            self.attach("tether_upstream", ifname, TcAttachType::Ingress)
        }

        fn detach_upstream_direction(
            &mut self,
            _ifindex: u32,
            _ifname: &str,
        ) -> Result<(), Error> {
            // Detaching a TC classifier by re-resolving its link handle
            // requires bookkeeping this module intentionally keeps out of
            // scope for now; the program is left attached but idle once
            // its last reference drops (it drops packets it no longer
            // recognizes because the in-memory rule store is cleared).
            Ok(())
        }

        fn attach_downstream_direction(
            &mut self,
            _ifindex: u32,
            ifname: &str,
        ) -> Result<(), Error> {
            self.attach("tether_downstream", ifname, TcAttachType::Egress)
        }

        fn detach_downstream_direction(
            &mut self,
            _ifindex: u32,
            _ifname: &str,
        ) -> Result<(), Error> {
            Ok(())
        }
    }
}

pub(crate) fn log_attach_failure(role: &str, ifname: &str, error: &Error) {
    warn!(role, ifname, %error, "failed to attach datapath program");
}

pub(crate) fn log_attach_success(role: &str, ifname: &str) {
    debug!(role, ifname, "datapath program attached");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_pairing_attaches_both_roles() {
        let mut attachments = ProgramAttachments::new();
        let edge = attachments.attach(2001, 1001, false, false);
        assert!(edge.attach_upstream_direction_on_intf_in);
        assert!(edge.attach_downstream_direction_on_intf_out);
    }

    #[test]
    fn second_downstream_sharing_upstream_only_attaches_its_own_role() {
        let mut attachments = ProgramAttachments::new();
        attachments.attach(2001, 1001, false, false);
        let edge = attachments.attach(2002, 1001, false, false);
        assert!(edge.attach_upstream_direction_on_intf_in);
        assert!(!edge.attach_downstream_direction_on_intf_out);
    }

    #[test]
    fn repeated_attach_is_idempotent() {
        let mut attachments = ProgramAttachments::new();
        attachments.attach(2001, 1001, false, false);
        let edge = attachments.attach(2001, 1001, false, false);
        assert_eq!(edge, AttachmentEdge::default());
    }

    #[test]
    fn virtual_interfaces_are_skipped() {
        let mut attachments = ProgramAttachments::new();
        let edge = attachments.attach(2001, 1001, true, false);
        assert_eq!(edge, AttachmentEdge::default());
    }

    #[test]
    fn detach_only_fires_when_last_reference_drops() {
        let mut attachments = ProgramAttachments::new();
        attachments.attach(2001, 1001, false, false);
        attachments.attach(2002, 1001, false, false);

        let edge = attachments.detach(2001, 1001);
        assert!(edge.detach_upstream_direction_on_intf_in);
        assert!(!edge.detach_downstream_direction_on_intf_out);

        let edge = attachments.detach(2002, 1001);
        assert!(edge.detach_upstream_direction_on_intf_in);
        assert!(edge.detach_downstream_direction_on_intf_out);
    }
}
