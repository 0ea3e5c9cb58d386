//! Arena heap: typed pools for every heap-resident value kind.
//!
//! Values reference pool entries by the `u32` handles defined in the core
//! crate, which is how cyclic structures (a table in its own metatable
//! chain, a closure capturing a local that holds the closure) stay
//! representable. Reclamation is deferred to the host's memory policy: pools
//! grow monotonically and are dropped with the state.

use crate::error::HostResult;
use crate::frame::{Frame, RetMode, MIN_STACK};
use crate::state::State;
use lunette_core::proto::Proto;
use lunette_core::table::Table;
use lunette_core::value::{ClosureRef, TableRef, ThreadRef, UpvalRef, UserDataRef, Value};
use std::any::Any;
use std::rc::Rc;

/// A host function: receives the running state, takes its arguments from
/// positive stack slots 1.., and reports how many top slots are results.
pub type HostFn = fn(&mut State) -> HostResult;

/// A runtime function instance.
pub enum Closure {
    /// Instantiated prototype plus its bound upvalues.
    Script {
        proto: Rc<Proto>,
        upvals: Vec<UpvalRef>,
    },
    /// Host function plus its bound upvalues.
    Host { func: HostFn, upvals: Vec<UpvalRef> },
}

impl Closure {
    pub fn upvals(&self) -> &[UpvalRef] {
        match self {
            Closure::Script { upvals, .. } | Closure::Host { upvals, .. } => upvals,
        }
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Closure::Script { upvals, .. } => write!(f, "script-closure({} upvals)", upvals.len()),
            Closure::Host { upvals, .. } => write!(f, "host-closure({} upvals)", upvals.len()),
        }
    }
}

/// A captured variable cell. Open upvalues alias a live stack slot of an
/// owning frame; closing lifts the current value into a private cell.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open {
        thread: ThreadRef,
        frame: usize,
        slot: usize,
    },
    Closed(Value),
}

/// Full userdata: a host payload with an optional metatable.
pub struct UserData {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableRef>,
}

/// Coroutine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    Suspended,
    Running,
    /// Resumed some other thread and is waiting on it.
    Normal,
    Dead,
}

/// Where a suspended thread delivers the next resume's arguments: the
/// result-marshalling contract of the call that was in flight when the
/// yield happened.
#[derive(Debug, Clone, Copy)]
pub struct Pending {
    pub ret: RetMode,
    pub want: i64,
}

/// An execution context: a chain of frames plus scheduler bookkeeping.
pub struct Thread {
    pub frames: Vec<Frame>,
    pub status: CoStatus,
    pub resumer: Option<ThreadRef>,
    pub pending: Option<Pending>,
    /// Total slot capacity across frames, checked against the per-thread
    /// ceiling.
    pub slots_in_use: usize,
}

impl Thread {
    /// The main thread starts Normal with an empty base frame for the host.
    pub fn new_main() -> Thread {
        Thread {
            frames: vec![Frame::new(MIN_STACK)],
            status: CoStatus::Normal,
            resumer: None,
            pending: None,
            slots_in_use: MIN_STACK,
        }
    }

    /// Fresh coroutines start Suspended; the base frame will hold the body
    /// function until the first resume.
    pub fn new_coroutine() -> Thread {
        Thread {
            status: CoStatus::Suspended,
            ..Thread::new_main()
        }
    }
}

/// The typed pools.
pub struct Heap {
    tables: Vec<Table>,
    closures: Vec<Closure>,
    upvals: Vec<Upvalue>,
    userdata: Vec<UserData>,
    threads: Vec<Thread>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            tables: Vec::new(),
            closures: Vec::new(),
            upvals: Vec::new(),
            userdata: Vec::new(),
            threads: Vec::new(),
        }
    }

    pub fn new_table(&mut self, array_hint: usize, hash_hint: usize) -> TableRef {
        self.tables.push(Table::new(array_hint, hash_hint));
        TableRef(self.tables.len() as u32 - 1)
    }

    pub fn table(&self, r: TableRef) -> &Table {
        &self.tables[r.0 as usize]
    }

    pub fn table_mut(&mut self, r: TableRef) -> &mut Table {
        &mut self.tables[r.0 as usize]
    }

    pub fn new_closure(&mut self, c: Closure) -> ClosureRef {
        self.closures.push(c);
        ClosureRef(self.closures.len() as u32 - 1)
    }

    pub fn closure(&self, r: ClosureRef) -> &Closure {
        &self.closures[r.0 as usize]
    }

    pub fn new_upval(&mut self, u: Upvalue) -> UpvalRef {
        self.upvals.push(u);
        UpvalRef(self.upvals.len() as u32 - 1)
    }

    pub fn upval(&self, r: UpvalRef) -> &Upvalue {
        &self.upvals[r.0 as usize]
    }

    pub fn upval_mut(&mut self, r: UpvalRef) -> &mut Upvalue {
        &mut self.upvals[r.0 as usize]
    }

    pub fn new_userdata(&mut self, data: Box<dyn Any>) -> UserDataRef {
        self.userdata.push(UserData {
            data,
            metatable: None,
        });
        UserDataRef(self.userdata.len() as u32 - 1)
    }

    pub fn userdata(&self, r: UserDataRef) -> &UserData {
        &self.userdata[r.0 as usize]
    }

    pub fn userdata_mut(&mut self, r: UserDataRef) -> &mut UserData {
        &mut self.userdata[r.0 as usize]
    }

    pub fn new_thread(&mut self, t: Thread) -> ThreadRef {
        self.threads.push(t);
        ThreadRef(self.threads.len() as u32 - 1)
    }

    pub fn thread(&self, r: ThreadRef) -> &Thread {
        &self.threads[r.0 as usize]
    }

    pub fn thread_mut(&mut self, r: ThreadRef) -> &mut Thread {
        &mut self.threads[r.0 as usize]
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
