use crate::tracer::address::{AddressRange, TargetAddress};
use crate::tracer::error::Error;
use crate::tracer::pad::JumpPadPool;
use crate::tracer::tracepoint::{
    FastPatch, InstallHandle, InstalledMechanism, Tracepoint, TracepointKind,
};
use crate::tracer::{CodePatcher, StaticProbe};
use crate::{tp_debug, tp_warn};
use anyhow::anyhow;
use smallvec::SmallVec;
use std::collections::HashMap;

/// One physical fast-tracepoint patch, shared by every entry stacked at
/// its address.
struct FastSite {
    /// Original bytes displaced by the jump.
    saved: SmallVec<[u8; 16]>,
    /// Live bytes at the address right after patching, used to detect
    /// third-party rewrites of our patch.
    patched: SmallVec<[u8; 16]>,
    orig_size: usize,
    pad: AddressRange,
    relocated: AddressRange,
    refs: u32,
}

/// One physical trap, shared by every entry stacked at its address.
struct TrapSite {
    saved: SmallVec<[u8; 16]>,
    patched: SmallVec<[u8; 16]>,
    refs: u32,
}

struct StaticSite {
    refs: u32,
}

/// Turns tracepoint entries into live target instrumentation and back.
///
/// Entries stacked at one address share a single physical patch: the
/// first install performs the patching, later installs only join the
/// site; uninstall detaches an entry and removes the patch when the last
/// one leaves.
pub(super) struct Installer {
    pool: Option<JumpPadPool>,
    fast_sites: HashMap<TargetAddress, FastSite>,
    trap_sites: HashMap<TargetAddress, TrapSite>,
    static_sites: HashMap<TargetAddress, StaticSite>,
    next_handle: u64,
}

impl Installer {
    pub(super) fn new(pool: Option<JumpPadPool>) -> Self {
        Self {
            pool,
            fast_sites: HashMap::new(),
            trap_sites: HashMap::new(),
            static_sites: HashMap::new(),
            next_handle: 1,
        }
    }

    pub(super) fn supports_fast(&self) -> bool {
        self.pool.is_some()
    }

    fn next_handle(&mut self) -> InstallHandle {
        let handle = InstallHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub(super) fn install(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
        probe: Option<&mut (dyn StaticProbe + 'static)>,
    ) -> Result<(), Error> {
        if tp.is_installed() {
            return Ok(());
        }
        match tp.kind() {
            TracepointKind::Trap => self.install_trap(tp, patcher),
            TracepointKind::Fast => self.install_fast(tp, patcher),
            TracepointKind::Static => {
                let probe = probe.ok_or(Error::UnsupportedKind(TracepointKind::Static))?;
                self.install_static(tp, probe)
            }
        }
    }

    pub(super) fn uninstall(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
        probe: Option<&mut (dyn StaticProbe + 'static)>,
    ) -> Result<(), Error> {
        let Some(mech) = tp.installed_mechanism() else {
            return Ok(());
        };
        match mech {
            InstalledMechanism::Trap(_) => self.uninstall_trap(tp, patcher),
            InstalledMechanism::Fast(_, _) => self.uninstall_fast(tp, patcher),
            InstalledMechanism::Static(_) => {
                let probe = probe.ok_or(Error::UnsupportedKind(TracepointKind::Static))?;
                self.uninstall_static(tp, probe)
            }
        }
    }

    fn install_fast(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), Error> {
        let address = tp.address();

        // later entries at an already-patched address only join the site
        if let Some(site) = self.fast_sites.get_mut(&address) {
            site.refs += 1;
            let patch = FastPatch {
                orig_size: site.orig_size,
                jump_pad: site.pad,
                relocated: site.relocated,
            };
            let handle = self.next_handle();
            tp.set_installed(InstalledMechanism::Fast(handle, patch));
            return Ok(());
        }

        let jump_size = patcher.jump_size();
        let orig_size = patcher
            .instruction_length_at(address, jump_size)
            .map_err(|e| Error::Patch("instruction_length_at", e))?;
        let saved: SmallVec<[u8; 16]> = patcher
            .read_bytes(address, orig_size)
            .map_err(|e| Error::Patch("read_bytes", e))?
            .into();

        let pool = self
            .pool
            .as_mut()
            .ok_or(Error::UnsupportedKind(TracepointKind::Fast))?;

        // Claim pad space for the displaced instructions plus the
        // trampoline back. Relocation may expand position-dependent
        // encodings; re-claim with the exact size when it does.
        let mut request = (orig_size + jump_size) as u64;
        let (claim, relocated_bytes) = loop {
            let claim = pool.allocate(request)?;
            let relocated = match patcher.relocate(&saved, address, claim.start) {
                Ok(bytes) => bytes,
                Err(e) => {
                    pool.release(claim);
                    return Err(Error::Patch("relocate", e));
                }
            };
            let needed = (relocated.len() + jump_size) as u64;
            if needed <= claim.len() {
                break (claim, relocated);
            }
            pool.release(claim);
            if needed <= request {
                return Err(Error::Patch(
                    "relocate",
                    anyhow!("relocated size does not converge at {address}"),
                ));
            }
            request = needed;
        };

        // Fill the pad, then patch the address last: a partially built
        // pad must never be reachable from target code.
        let reloc_end = claim.start.offset(relocated_bytes.len() as isize);
        let fill = (|| -> anyhow::Result<()> {
            patcher.write_bytes(claim.start, &relocated_bytes)?;
            patcher.write_jump(reloc_end, address.offset(orig_size as isize))?;
            patcher.write_jump(address, claim.start)?;
            Ok(())
        })();
        if let Err(e) = fill {
            self.pool
                .as_mut()
                .expect("pool presence checked above")
                .release(claim);
            return Err(Error::Patch("fill_jump_pad", e));
        }

        let patched: SmallVec<[u8; 16]> = match patcher.read_bytes(address, orig_size) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                // the jump is live but unverifiable: roll the whole patch back
                let restore = patcher
                    .restore_bytes(address, &saved)
                    .map_err(|e| Error::Patch("restore_bytes", e));
                self.pool
                    .as_mut()
                    .expect("pool presence checked above")
                    .release(claim);
                restore?;
                return Err(Error::Patch("read_bytes", e));
            }
        };

        let relocated = AddressRange::new(claim.start, reloc_end);
        self.fast_sites.insert(
            address,
            FastSite {
                saved,
                patched,
                orig_size,
                pad: claim,
                relocated,
                refs: 1,
            },
        );
        let handle = self.next_handle();
        tp.set_installed(InstalledMechanism::Fast(
            handle,
            FastPatch {
                orig_size,
                jump_pad: claim,
                relocated,
            },
        ));
        tp_debug!(
            target: "tracer",
            "fast tracepoint {} installed at {address}, pad {claim}",
            tp.number()
        );
        Ok(())
    }

    fn uninstall_fast(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), Error> {
        let address = tp.address();
        let site = self
            .fast_sites
            .get_mut(&address)
            .expect("fast site must exist for an installed entry");

        if site.refs > 1 {
            site.refs -= 1;
            tp.clear_installed();
            return Ok(());
        }

        // last entry at this site: verify the live patch, restore, release
        let live = patcher
            .read_bytes(address, site.orig_size)
            .map_err(|e| Error::Patch("read_bytes", e))?;
        if live[..] != site.patched[..] {
            // someone rewrote our patch; detach without touching the code
            let site = self
                .fast_sites
                .remove(&address)
                .expect("site presence checked above");
            self.pool
                .as_mut()
                .expect("fast site implies a configured pool")
                .release(site.pad);
            tp.clear_installed();
            tp_warn!(target: "tracer", "live code at {address} diverges from the installed jump");
            return Err(Error::PatchCorruption(address));
        }

        patcher
            .restore_bytes(address, &site.saved)
            .map_err(|e| Error::Patch("restore_bytes", e))?;
        let site = self
            .fast_sites
            .remove(&address)
            .expect("site presence checked above");
        self.pool
            .as_mut()
            .expect("fast site implies a configured pool")
            .release(site.pad);
        tp.clear_installed();
        tp_debug!(
            target: "tracer",
            "fast tracepoint {} removed from {address}",
            tp.number()
        );
        Ok(())
    }

    fn install_trap(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), Error> {
        let address = tp.address();

        if let Some(site) = self.trap_sites.get_mut(&address) {
            site.refs += 1;
            let handle = self.next_handle();
            tp.set_installed(InstalledMechanism::Trap(handle));
            return Ok(());
        }

        let saved: SmallVec<[u8; 16]> = patcher
            .write_trap(address)
            .map_err(|e| Error::Patch("write_trap", e))?
            .into();
        let patched: SmallVec<[u8; 16]> = match patcher.read_bytes(address, saved.len()) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                patcher
                    .restore_bytes(address, &saved)
                    .map_err(|e| Error::Patch("restore_bytes", e))?;
                return Err(Error::Patch("read_bytes", e));
            }
        };

        self.trap_sites.insert(
            address,
            TrapSite {
                saved,
                patched,
                refs: 1,
            },
        );
        let handle = self.next_handle();
        tp.set_installed(InstalledMechanism::Trap(handle));
        tp_debug!(
            target: "tracer",
            "trap tracepoint {} installed at {address}",
            tp.number()
        );
        Ok(())
    }

    fn uninstall_trap(
        &mut self,
        tp: &Tracepoint,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), Error> {
        let address = tp.address();
        let site = self
            .trap_sites
            .get_mut(&address)
            .expect("trap site must exist for an installed entry");

        if site.refs > 1 {
            site.refs -= 1;
            tp.clear_installed();
            return Ok(());
        }

        let live = patcher
            .read_bytes(address, site.patched.len())
            .map_err(|e| Error::Patch("read_bytes", e))?;
        if live[..] != site.patched[..] {
            self.trap_sites.remove(&address);
            tp.clear_installed();
            tp_warn!(target: "tracer", "live code at {address} diverges from the installed trap");
            return Err(Error::PatchCorruption(address));
        }

        patcher
            .restore_bytes(address, &site.saved)
            .map_err(|e| Error::Patch("restore_bytes", e))?;
        self.trap_sites.remove(&address);
        tp.clear_installed();
        Ok(())
    }

    fn install_static(
        &mut self,
        tp: &Tracepoint,
        probe: &mut dyn StaticProbe,
    ) -> Result<(), Error> {
        let address = tp.address();

        if let Some(site) = self.static_sites.get_mut(&address) {
            site.refs += 1;
        } else {
            probe
                .hook(address)
                .map_err(|e| Error::Patch("hook", e))?;
            self.static_sites.insert(address, StaticSite { refs: 1 });
            tp_debug!(
                target: "tracer",
                "static tracepoint {} hooked at {address}",
                tp.number()
            );
        }
        let handle = self.next_handle();
        tp.set_installed(InstalledMechanism::Static(handle));
        Ok(())
    }

    fn uninstall_static(
        &mut self,
        tp: &Tracepoint,
        probe: &mut dyn StaticProbe,
    ) -> Result<(), Error> {
        let address = tp.address();
        let site = self
            .static_sites
            .get_mut(&address)
            .expect("static site must exist for an installed entry");

        if site.refs > 1 {
            site.refs -= 1;
        } else {
            probe
                .unhook(address)
                .map_err(|e| Error::Patch("unhook", e))?;
            self.static_sites.remove(&address);
        }
        tp.clear_installed();
        Ok(())
    }
}
