//! A worker-thread driver around [`Emulator`].
//!
//! The decode-execute loop runs on its own thread so "run" never blocks an
//! interactive caller. Control flows through channels: the driver sends
//! [`Request`]s, the worker answers with [`Event`]s, and a shared stop flag
//! interrupts a run cooperatively — only ever between instructions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::cpu::{FlagSet, RegisterFile};
use crate::engine::{Emulator, RunExit, State, StepEvent};

#[derive(Debug, Clone)]
pub enum Request {
    Step,
    Run,
    StepBack,
    Reset,
    AddBreakpoint(u64),
    RemoveBreakpoint(u64),
    /// Read a window of memory for display.
    Inspect { addr: u64, len: usize },
    Shutdown,
}

/// Register/flag state published to the driver after every request. The
/// core never formats this; presentation belongs to the caller.
#[derive(Debug, Clone)]
pub struct StateView {
    pub cpu: RegisterFile,
    pub flags: FlagSet,
    pub state: State,
}

#[derive(Debug)]
pub enum Event {
    Stepped(StepEvent, StateView),
    Faulted(crate::error::EmulatorError, StateView),
    RunEnded(RunExit, StateView),
    SteppedBack(bool, StateView),
    WasReset(StateView),
    Memory { addr: u64, bytes: Vec<u8> },
    BreakpointsChanged,
}

pub struct Runner {
    requests: Sender<Request>,
    events: Receiver<Event>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    /// Moves the emulator onto a dedicated worker thread.
    pub fn spawn(mut emu: Emulator) -> Runner {
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (ev_tx, ev_rx) = mpsc::channel::<Event>();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            worker(&mut emu, req_rx, ev_tx, worker_stop);
        });

        Runner {
            requests: req_tx,
            events: ev_rx,
            stop,
            handle: Some(handle),
        }
    }

    pub fn send(&self, request: Request) {
        // a dead worker means shutdown already happened; nothing to do
        let _ = self.requests.send(request);
    }

    pub fn step(&self) {
        self.send(Request::Step);
    }

    /// Starts a run. The worker owns the loop; interrupt it with
    /// [`Runner::request_stop`].
    pub fn run(&self) {
        self.stop.store(false, Ordering::Relaxed);
        self.send(Request::Run);
    }

    /// Raises the cooperative stop flag. The run ends at the next
    /// instruction boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.request_stop();
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn view(emu: &Emulator) -> StateView {
    StateView {
        cpu: emu.cpu.clone(),
        flags: emu.flags,
        state: emu.state(),
    }
}

fn worker(
    emu: &mut Emulator,
    requests: Receiver<Request>,
    events: Sender<Event>,
    stop: Arc<AtomicBool>,
) {
    debug!("emulator worker started");
    while let Ok(request) = requests.recv() {
        let event = match request {
            Request::Step => match emu.step() {
                Ok(ev) => Event::Stepped(ev, view(emu)),
                Err(e) => Event::Faulted(e, view(emu)),
            },
            Request::Run => {
                let exit = emu.run(&stop);
                Event::RunEnded(exit, view(emu))
            }
            Request::StepBack => {
                let ok = emu.step_back();
                Event::SteppedBack(ok, view(emu))
            }
            Request::Reset => {
                emu.reset();
                Event::WasReset(view(emu))
            }
            Request::AddBreakpoint(addr) => {
                emu.add_breakpoint(addr);
                Event::BreakpointsChanged
            }
            Request::RemoveBreakpoint(addr) => {
                emu.remove_breakpoint(addr);
                Event::BreakpointsChanged
            }
            Request::Inspect { addr, len } => Event::Memory {
                addr,
                bytes: emu.memory.read_vec(addr, len),
            },
            Request::Shutdown => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("emulator worker exited");
}
