use std::{
    ffi::OsString,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use itertools::{chain, Itertools};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::{
    args::{disks::DiskResolver, network::NicResolver},
    config::Config,
    data::{Connection, DiskSpec, Firmware, NetSpec},
    error::{Error, Warning},
    image::{Inspect, QemuImg},
    oarg, prereq,
    probe::{CapabilityCache, Introspect, QemuIntrospect},
    tap::{self, DryRunTapControl, HostTapControl, SudoTapControl, TapControl, TapSession},
    utils::{shell_quote, ArgDisplay, EmulatorArgs, QemuArg},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FORWARDED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub kvm: Option<PathBuf>,
    pub disks: Vec<DiskSpec>,
    pub netdevs: Vec<NetSpec>,
    pub firmware: Firmware,
    pub extra_args: Vec<OsString>,
    pub dry_run: bool,
    pub attached: bool,
}

impl LaunchOptions {
    /// Resolve every device, provision taps and assemble the hypervisor command line.
    pub fn prepare(self, config: &Config) -> Result<Launch, Error> {
        let binary = prereq::hypervisor(self.kvm.as_deref(), config)?;
        log::debug!("Using hypervisor {}", binary.display());

        let qemu_img = match self.disks.iter().any(|disk| disk.format.is_none()) {
            true => prereq::locate(&config.qemu_img, config)?,
            false => config.qemu_img.clone(),
        };

        let bridged = self.netdevs.iter().any(|netdev| netdev.connection.bridge().is_some());
        let prefix = config.tap_prefix.clone().unwrap_or_else(tap::default_prefix);
        let control: Box<dyn TapControl> = match (self.dry_run, bridged) {
            (false, true) => privileged_control(prefix, config)?,
            _ => Box::new(DryRunTapControl::new(prefix)),
        };

        let cache = CapabilityCache::new(QemuIntrospect::new(&binary));
        self.compose(binary, cache, &QemuImg::new(qemu_img), control, config)
    }

    pub(crate) fn compose<P: Introspect, I: Inspect>(
        self,
        binary: PathBuf,
        mut cache: CapabilityCache<P>,
        inspector: &I,
        control: Box<dyn TapControl>,
        config: &Config,
    ) -> Result<Launch, Error> {
        let (disk_args, warnings) = DiskResolver::new(&mut cache, inspector, config).disk_args(&self.disks)?;
        let firmware_args = self.firmware.firmware_args(self.dry_run)?;

        // Taps are created last so that a malformed device never leaves one behind.
        // The guard is dropped after the session, so a signal can't skip teardown.
        let signals = SignalGuard::install()?;
        let connections: Vec<Connection> = self.netdevs.iter().map(|netdev| netdev.connection.clone()).collect();
        let mut session = TapSession::new(control);
        let reports = session.provision(&connections)?;
        check_interrupted()?;
        let net_args = NicResolver::new(&mut cache, config).nic_args(&self.netdevs, &reports)?;

        let display = chain!(firmware_args.display(), disk_args.display(), net_args.display()).collect();
        let args = chain!(
            firmware_args.qemu_args(),
            disk_args.qemu_args(),
            net_args.qemu_args(),
            self.extra_args.into_iter().map(|arg| oarg!(arg)),
        )
        .collect();

        let attached = self.attached || self.dry_run || session.records().is_empty();
        Ok(Launch {
            binary,
            args,
            display,
            warnings,
            attached,
            session,
            _firmware: firmware_args,
            _signals: signals,
        })
    }
}

fn privileged_control(prefix: String, config: &Config) -> Result<Box<dyn TapControl>, Error> {
    let owner = tap_owner();
    if nix::unistd::geteuid().is_root() {
        prereq::locate(Path::new("ip"), config)?;
        return Ok(Box::new(HostTapControl::new(prefix, owner)));
    }
    let sudo = prereq::locate(Path::new("sudo"), config)?;
    let helper = std::env::current_exe().map_err(|e| Error::Command("launch-vm".into(), e.to_string()))?;
    Ok(Box::new(SudoTapControl::new(sudo, helper, prefix, owner)))
}

/// The user who should own the taps: the one who invoked `sudo`, else the current user.
fn tap_owner() -> String {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if !user.is_empty() {
            return user;
        }
    }
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// A fully composed hypervisor invocation. Dropping it removes any provisioned taps.
pub struct Launch {
    binary: PathBuf,
    args: Vec<QemuArg>,
    display: Vec<ArgDisplay>,
    warnings: Vec<Warning>,
    attached: bool,
    session: TapSession,
    // Holds the scratch UEFI variable store until the hypervisor exits.
    _firmware: crate::args::firmware::FirmwareArgs,
    // Declared after `session`: handlers stay installed until teardown is done.
    _signals: SignalGuard,
}

impl Launch {
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[QemuArg] {
        &self.args
    }

    pub fn display(&self) -> &[ArgDisplay] {
        &self.display
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The command as it would be typed into a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(shell_quote(self.binary.as_os_str())).chain(self.args.iter().map(|arg| shell_quote(arg))).join(" ")
    }

    /// Run the hypervisor to completion and tear down the taps. Returns its exit code.
    pub fn run(mut self) -> Result<i32, Error> {
        let status = check_interrupted().and_then(|()| self.spawn_and_wait());
        self.session.teardown();

        let status = status?;
        log::debug!("{} exited with {status}", self.binary.display());
        Ok(status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or_default()))
    }

    fn spawn_and_wait(&self) -> Result<ExitStatus, Error> {
        let command_error = |e: std::io::Error| Error::Command(self.binary.display().to_string(), e.to_string());
        let mut command = Command::new(&self.binary);
        command.args(&self.args);

        let mut child = command.spawn().map_err(command_error)?;
        log::info!("Started {} (pid {})", self.binary.display(), child.id());
        if self.attached {
            let status = child.wait().map_err(command_error)?;
            if let Some(signal) = take_pending_signal() {
                log::info!("Received {signal} while the hypervisor was running");
            }
            Ok(status)
        } else {
            wait_detached(&mut child).map_err(command_error)
        }
    }
}

fn wait_detached(child: &mut Child) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(signal) = take_pending_signal() {
            log::warn!("Received {signal}, stopping the hypervisor (pid {})", child.id());
            child.kill()?;
            return child.wait();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: nix::libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::SeqCst);
}

fn take_pending_signal() -> Option<Signal> {
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

fn check_interrupted() -> Result<(), Error> {
    match take_pending_signal() {
        Some(signal) => Err(Error::Interrupted(signal.to_string())),
        None => Ok(()),
    }
}

/// Records termination signals for the lifetime of the guard, restoring the previous handlers on drop.
struct SignalGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    fn install() -> Result<Self, Error> {
        PENDING_SIGNAL.store(0, Ordering::SeqCst);
        let action = SigAction::new(SigHandler::Handler(record_signal), SaFlags::SA_RESTART, SigSet::empty());
        let mut guard = Self { previous: Vec::new() };
        for signal in FORWARDED_SIGNALS {
            // SAFETY: the handler only stores to an atomic.
            let previous = unsafe { sigaction(signal, &action) }.map_err(|e| Error::Command("sigaction".into(), e.to_string()))?;
            guard.previous.push((signal, previous));
        }
        Ok(guard)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (signal, action) in self.previous.drain(..) {
            // SAFETY: restores a handler that was installed before.
            if let Err(e) = unsafe { sigaction(signal, &action) } {
                log::warn!("Could not restore the {signal} handler: {e}");
            }
        }
    }
}
