//! The line-oriented operator shell: `load`, `start`/`stop`/`reset`,
//! `status`, `sys info`, and the `dbg` subcommand family. Every command
//! response ends with a single `OK:` or `ERROR:<message>` terminator line
//! so a scripted client can frame replies without parsing free text.

use crate::debugger::{DebugCommand, DebugEngine};
use crate::hal::Hal;
use crate::loader;
use crate::log::Logger;
use crate::memory;
use crate::orchestrator::Orchestrator;
use serde_json::json;
use std::io::{BufRead, Write};

pub struct Shell<H: Hal> {
    orchestrator: Option<Orchestrator<H>>,
    debug_engine: DebugEngine,
    fatal_overrun_threshold_us: u32,
    make_hal: Box<dyn Fn() -> H>,
    logger: Option<Logger>,
}

impl<H: Hal> Shell<H> {
    pub fn new(make_hal: Box<dyn Fn() -> H>, fatal_overrun_threshold_us: u32) -> Self {
        let (debug_engine, _events) = DebugEngine::new();
        Self { orchestrator: None, debug_engine, fatal_overrun_threshold_us, make_hal, logger: None }
    }

    /// Attaches the process's reloadable log filter so `dbg loglevel`
    /// changes verbosity without restarting the runtime.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> std::io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.dispatch(line, &mut output) {
                Ok(Some(suffix)) => writeln!(output, "OK:{suffix}")?,
                Ok(None) => writeln!(output, "OK:")?,
                Err(msg) => writeln!(output, "ERROR:{msg}")?,
            }
            output.flush()?;
        }
    }

    /// Returns `Ok(Some(suffix))` when a command has a payload to append to
    /// its `OK:` terminator (e.g. `load`'s byte count), `Ok(None)` for
    /// commands whose success needs no payload, and `Err` for failures.
    fn dispatch<W: Write>(&mut self, line: &str, output: &mut W) -> Result<Option<String>, String> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let rest: Vec<&str> = parts.collect();

        match command {
            "load" => self.cmd_load(&rest).map(Some),
            "start" => self
                .with_orchestrator(|o| {
                    o.start();
                    Ok(())
                })
                .map(|()| None),
            "stop" => self
                .with_orchestrator(|o| {
                    o.stop();
                    Ok(())
                })
                .map(|()| None),
            "reset" => self
                .with_orchestrator(|o| {
                    let targets: Vec<(u16, u32)> = o
                        .scheduler()
                        .task_ids()
                        .into_iter()
                        .filter_map(|id| o.scheduler().entry_pc(id).map(|pc| (id, pc)))
                        .collect();
                    for (id, entry) in targets {
                        if let Some(vm) = o.scheduler_mut().vm_mut(id) {
                            vm.reset(entry);
                        }
                    }
                    Ok(())
                })
                .map(|()| None),
            "status" => {
                self.cmd_status(rest.first() == Some(&"--json"), output)?;
                Ok(None)
            }
            "sys" if rest.first() == Some(&"info") => {
                self.cmd_sys_info(rest.get(1) == Some(&"--json"), output)?;
                Ok(None)
            }
            "dbg" => self.cmd_dbg(&rest, output).map(|()| None),
            other => Err(format!("unknown command '{other}'")),
        }
    }

    fn with_orchestrator<T>(&mut self, f: impl FnOnce(&mut Orchestrator<H>) -> Result<T, String>) -> Result<T, String> {
        let orchestrator = self.orchestrator.as_mut().ok_or("no program loaded")?;
        f(orchestrator)
    }

    /// Loads and installs a program, responding with its byte size.
    fn cmd_load(&mut self, rest: &[&str]) -> Result<String, String> {
        let path = rest.first().ok_or("usage: load <file>")?;
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        let program = loader::parse(&bytes).map_err(|e| e.to_string())?;
        let hal = (self.make_hal)();
        self.orchestrator = Some(Orchestrator::new(hal, &program, self.fatal_overrun_threshold_us));
        Ok(bytes.len().to_string())
    }

    /// Reports the documented snapshot: runtime state, uptime, cycle
    /// statistics, per-task status, a region-size summary, the task-0
    /// (shell sessions target a single task, see `cmd_dbg`) `Vm` state, and
    /// the current OPI contents.
    fn cmd_status<W: Write>(&mut self, as_json: bool, output: &mut W) -> Result<(), String> {
        self.with_orchestrator(|o| {
            let stats = o.stats();
            let tasks: Vec<_> = o
                .scheduler()
                .statuses()
                .into_iter()
                .map(|s| json!({"id": s.id, "cycles": s.cycles, "overruns": s.overruns, "fault": s.last_fault.map(|(f, pc)| format!("{f} @ pc={pc}"))}))
                .collect();
            let vm = o.scheduler_mut().vm_mut(0).map(|vm| {
                json!({
                    "pc": vm.pc(),
                    "sp": vm.sp(),
                    "halted": matches!(vm.state(), crate::vm::VmState::Error | crate::vm::VmState::Idle { .. }),
                    "error": vm.error().map(|(f, pc)| format!("{f} @ pc={pc}")),
                })
            });
            let snapshot = json!({
                "state": format!("{:?}", o.state()),
                "uptime_ms": o.uptime_ms(),
                "stats": {
                    "cycles": stats.cycle_count,
                    "overruns": stats.overrun_count,
                    "active_tasks": o.scheduler().task_count(),
                    "program_size": o.program_size(),
                },
                "tasks": tasks,
                "memory": {
                    "ipi_size": memory::IPI_SIZE,
                    "opi_size": memory::OPI_SIZE,
                    "work_size": memory::WORK_SIZE,
                    "retain_size": memory::RETAIN_SIZE,
                    "retain_dirty": o.memory().retain_dirty(),
                },
                "vm": vm,
                "opi": o.memory().opi_bytes(),
            });
            write_snapshot(output, &snapshot, as_json)
        })
    }

    /// Reports board/firmware identity, capabilities, and fixed memory
    /// region sizes — static facts about this build, not runtime state.
    fn cmd_sys_info<W: Write>(&mut self, as_json: bool, output: &mut W) -> Result<(), String> {
        let snapshot = json!({
            "board": "simulated",
            "firmware_version": env!("CARGO_PKG_VERSION"),
            "capabilities": {
                "fpu": true,
                "mpu": false,
                "scheduler": "priority-preemptive",
                "max_tasks": u16::MAX,
            },
            "memory": {
                "ipi_size": memory::IPI_SIZE,
                "opi_size": memory::OPI_SIZE,
                "work_size": memory::WORK_SIZE,
                "retain_size": memory::RETAIN_SIZE,
                "code_base": memory::CODE_BASE,
            },
        });
        write_snapshot(output, &snapshot, as_json)
    }

    fn cmd_dbg<W: Write>(&mut self, rest: &[&str], output: &mut W) -> Result<(), String> {
        if rest.first().copied() == Some("loglevel") {
            let level = rest.get(1).ok_or("usage: dbg loglevel <level>")?;
            let logger = self.logger.as_ref().ok_or("no reloadable logger attached")?;
            logger.set_log_level(level);
            return Ok(());
        }

        let orchestrator = self.orchestrator.as_mut().ok_or("no program loaded")?;
        let subcommand = rest.first().copied().ok_or("usage: dbg <info|peek|poke|pause|resume|step|bp|loglevel>")?;
        let task_id = 0u16; // single-task shell sessions target the first task; multi-task targeting is future work

        match subcommand {
            "info" => {
                let snapshot = orchestrator.debug_status(task_id, &self.debug_engine).ok_or("no such task")?;
                writeln!(
                    output,
                    "state={:?} pc={} sp={} cycles={} tos={:?}",
                    snapshot.state, snapshot.pc, snapshot.sp, snapshot.cycles, snapshot.top_of_stack
                )
                .map_err(|e| e.to_string())
            }
            "peek" => {
                let address: u32 = rest.get(1).ok_or("usage: dbg peek <addr> <len>")?.parse().map_err(|_| "bad address")?;
                let len: usize = rest.get(2).ok_or("usage: dbg peek <addr> <len>")?.parse().map_err(|_| "bad length")?;
                let bytes = self.debug_engine.peek(orchestrator.memory(), address, len).map_err(|e| e.to_string())?;
                writeln!(output, "{bytes:02x?}").map_err(|e| e.to_string())
            }
            "poke" => {
                let address: u32 = rest.get(1).ok_or("usage: dbg poke <addr> <val>")?.parse().map_err(|_| "bad address")?;
                let value: u16 = rest.get(2).ok_or("usage: dbg poke <addr> <val>")?.parse().map_err(|_| "bad value")?;
                orchestrator
                    .debug_poke(task_id, &self.debug_engine, address, &value.to_le_bytes())
                    .map_err(|e| e.to_string())
            }
            "pause" => orchestrator.debug_apply(task_id, DebugCommand::Pause, &self.debug_engine),
            "resume" => orchestrator.debug_apply(task_id, DebugCommand::Resume, &self.debug_engine),
            "step" => orchestrator.debug_apply(task_id, DebugCommand::Step, &self.debug_engine),
            "bp" => Self::cmd_bp(rest, orchestrator, task_id, &self.debug_engine),
            other => Err(format!("unknown dbg subcommand '{other}'")),
        }
    }

    fn cmd_bp(
        rest: &[&str],
        orchestrator: &mut Orchestrator<H>,
        task_id: u16,
        debug_engine: &DebugEngine,
    ) -> Result<(), String> {
        let command = match rest.get(1).copied() {
            Some("add") => {
                let pc: u32 = rest.get(2).ok_or("usage: dbg bp add <pc>")?.parse().map_err(|_| "bad pc")?;
                DebugCommand::SetBreakpoint { pc }
            }
            Some("remove") => {
                let pc: u32 = rest.get(2).ok_or("usage: dbg bp remove <pc>")?.parse().map_err(|_| "bad pc")?;
                DebugCommand::RemoveBreakpoint { pc }
            }
            Some("clear") => DebugCommand::ClearBreakpoints,
            _ => return Err("usage: dbg bp <add|remove|clear>".to_string()),
        };
        orchestrator.debug_apply(task_id, command, debug_engine)
    }
}

/// Writes a snapshot as compact JSON (`--json`) or pretty-printed JSON
/// (the human-readable default) — same structure either way, so a scripted
/// client parses the same field names regardless of which mode asked.
fn write_snapshot<W: Write>(output: &mut W, snapshot: &serde_json::Value, as_json: bool) -> Result<(), String> {
    let rendered =
        if as_json { serde_json::to_string(snapshot) } else { serde_json::to_string_pretty(snapshot) }
            .map_err(|e| e.to_string())?;
    writeln!(output, "{rendered}").map_err(|e| e.to_string())
}
