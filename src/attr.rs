//! Thread creation attributes.

use nix::errno::Errno;
use nix::unistd;

/// Whether a new thread can be joined or reclaims itself on exit.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DetachState {
    Joinable,
    Detached,
}

/// Kernel scheduling policy for a new thread. Anything other than `Other`
/// requires root.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SchedPolicy {
    Other,
    Fifo,
    RoundRobin,
}

impl SchedPolicy {
    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }
}

/// Whether the new thread takes scheduling from the attribute object or from
/// its creator.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InheritSched {
    Explicit,
    Inherit,
}

/// Contention scope. Threads here are kernel tasks, so only system scope is
/// supported.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scope {
    System,
    Process,
}

/// Attributes consulted at thread creation.
#[derive(Copy, Clone)]
pub struct Attr {
    pub(crate) detach_state: DetachState,
    pub(crate) sched_policy: SchedPolicy,
    pub(crate) sched_param: libc::sched_param,
    pub(crate) inherit_sched: InheritSched,
    pub(crate) scope: Scope,
}

impl Default for Attr {
    fn default() -> Attr {
        Attr::new()
    }
}

impl Attr {
    pub fn new() -> Attr {
        Attr {
            detach_state: DetachState::Joinable,
            sched_policy: SchedPolicy::Other,
            sched_param: libc::sched_param { sched_priority: 0 },
            inherit_sched: InheritSched::Explicit,
            scope: Scope::System,
        }
    }

    pub fn set_detach_state(&mut self, state: DetachState) -> Result<(), Errno> {
        self.detach_state = state;
        Ok(())
    }

    pub fn detach_state(&self) -> DetachState {
        self.detach_state
    }

    /// Priority must fall within the policy's kernel-reported range.
    pub fn set_sched_param(&mut self, param: libc::sched_param) -> Result<(), Errno> {
        let policy = self.sched_policy.as_raw();
        let max_prio = unsafe { libc::sched_get_priority_max(policy) };
        let min_prio = unsafe { libc::sched_get_priority_min(policy) };
        if param.sched_priority < min_prio || param.sched_priority > max_prio {
            return Err(Errno::EINVAL);
        }
        self.sched_param = param;
        Ok(())
    }

    pub fn sched_param(&self) -> libc::sched_param {
        self.sched_param
    }

    /// Elevated policies are refused for non-root callers.
    pub fn set_sched_policy(&mut self, policy: SchedPolicy) -> Result<(), Errno> {
        if policy != SchedPolicy::Other && !unistd::geteuid().is_root() {
            return Err(Errno::EOPNOTSUPP);
        }
        self.sched_policy = policy;
        Ok(())
    }

    pub fn sched_policy(&self) -> SchedPolicy {
        self.sched_policy
    }

    pub fn set_inherit_sched(&mut self, inherit: InheritSched) -> Result<(), Errno> {
        self.inherit_sched = inherit;
        Ok(())
    }

    pub fn inherit_sched(&self) -> InheritSched {
        self.inherit_sched
    }

    pub fn set_scope(&mut self, scope: Scope) -> Result<(), Errno> {
        match scope {
            Scope::System => {
                self.scope = scope;
                Ok(())
            }
            Scope::Process => Err(Errno::EOPNOTSUPP),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}
