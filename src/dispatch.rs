//! Command dispatch and authorization.
//!
//! Incoming text is matched against [`COMMANDS`] in table order. A label
//! matches when the text starts with it and the next byte is either the end
//! of the text or a space, so `/open 5` runs `/open` but `/opened` does not.
//! The caller's role is checked once, against the table, before any handler
//! runs; a denied command has no side effects.

use core::fmt::Write as _;

use heapless::String;

use crate::config::{Setting, Settings};
use crate::gate::{Clock, Gate, GateBusy, GateQueue, GateRequest};
use crate::parser::ParsedUpdate;
use crate::registry::{is_valid_id, Listing, Registry, RegistryError, Table};
use crate::storage::Store;
use crate::ticks;

/// Longest reply the bot sends.
pub const REPLY_LEN: usize = 2048;

pub type Reply = String<REPLY_LEN>;

/// How long a handler waits for room in the gate queue or for a status.
pub const GATE_QUEUE_TIMEOUT_MS: u32 = 10_000;

const NOT_AUTHORIZED: &str = "You're not authorized. Contact house committee";
const UNAUTHORIZED: &str = "Unauthorized";
const UNKNOWN_COMMAND: &str = "Unknown command";
const GATE_BUSY: &str = "Gate is busy, try again";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Anonymous,
    User,
    Admin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Open(Gate),
    OpenAndLock,
    Unlock,
    Status,
    Start,
    Help,
    Settings,
    Add(Table),
    Drop(Table),
    List(Table),
    Configure(Setting),
}

pub struct Command {
    pub label: &'static str,
    pub role: Role,
    /// Reply when the caller's role is too low.
    pub denied: &'static str,
    pub action: Action,
}

const fn command(label: &'static str, role: Role, denied: &'static str, action: Action) -> Command {
    Command {
        label,
        role,
        denied,
        action,
    }
}

/// Captions shown on the reply keyboard, in display order.
pub const KEYBOARD: [&str; 5] = [
    "Open upper gate",
    "Open lower gate",
    "Open and lock lower gate",
    "Unlock lower gate",
    "Lower gate status",
];

pub static COMMANDS: &[Command] = &[
    command(KEYBOARD[0], Role::User, UNAUTHORIZED, Action::Open(Gate::Upper)),
    command(KEYBOARD[1], Role::User, UNAUTHORIZED, Action::Open(Gate::Lower)),
    command(KEYBOARD[2], Role::User, UNAUTHORIZED, Action::OpenAndLock),
    command(KEYBOARD[3], Role::User, UNAUTHORIZED, Action::Unlock),
    command(KEYBOARD[4], Role::User, UNAUTHORIZED, Action::Status),
    command("/open", Role::User, UNAUTHORIZED, Action::Open(Gate::Lower)),
    command("/lockopened", Role::User, UNAUTHORIZED, Action::OpenAndLock),
    command("/unlock", Role::User, UNAUTHORIZED, Action::Unlock),
    command("/status", Role::User, UNAUTHORIZED, Action::Status),
    command("/start", Role::Anonymous, NOT_AUTHORIZED, Action::Start),
    command("/adduser", Role::Admin, "Unauthorized to add user", Action::Add(Table::Users)),
    command("/dropuser", Role::Admin, "Unauthorized to drop user", Action::Drop(Table::Users)),
    command("/users", Role::Admin, "Unauthorized to list users", Action::List(Table::Users)),
    command("/addadmin", Role::Admin, "Unauthorized to add admin", Action::Add(Table::Admins)),
    command("/dropadmin", Role::Admin, "Unauthorized to drop admin", Action::Drop(Table::Admins)),
    command("/admins", Role::Admin, "Unauthorized to list admins", Action::List(Table::Admins)),
    command(
        "/cfggatepoll",
        Role::Admin,
        "Unauthorized to set duration",
        Action::Configure(Setting::GatePoll),
    ),
    command(
        "/cfgopenpulseduration",
        Role::Admin,
        "Unauthorized to set duration",
        Action::Configure(Setting::OpenPulseDuration),
    ),
    command(
        "/cfgopenduration",
        Role::Admin,
        "Unauthorized to set duration",
        Action::Configure(Setting::OpenDuration),
    ),
    command(
        "/cfglockduration",
        Role::Admin,
        "Unauthorized to set duration",
        Action::Configure(Setting::LockDuration),
    ),
    command(
        "/cfgopenlevel",
        Role::Admin,
        "Unauthorized to set level",
        Action::Configure(Setting::OpenLevel),
    ),
    command("/help", Role::User, NOT_AUTHORIZED, Action::Help),
    command("/settings", Role::User, NOT_AUTHORIZED, Action::Settings),
];

/// First command whose label prefixes `text` on a word boundary.
pub fn match_command(text: &[u8]) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| {
        let label = c.label.as_bytes();
        text.starts_with(label) && matches!(text.get(label.len()), None | Some(b' '))
    })
}

/// The gate loop as seen from a command handler.
pub trait GateLink {
    fn request(&mut self, request: GateRequest) -> Result<(), GateBusy>;
    /// Last published `diff(now, close_at)` of the status gate.
    fn status(&mut self) -> Option<i32>;
}

/// [`GateLink`] over the shared [`GateQueue`] with bounded waits.
pub struct QueueLink<'q, C> {
    queue: &'q GateQueue,
    clock: C,
}

impl<'q, C: Clock> QueueLink<'q, C> {
    pub fn new(queue: &'q GateQueue, clock: C) -> Self {
        Self { queue, clock }
    }
}

impl<C: Clock> GateLink for QueueLink<'_, C> {
    fn request(&mut self, request: GateRequest) -> Result<(), GateBusy> {
        self.queue.submit(&self.clock, request, GATE_QUEUE_TIMEOUT_MS)
    }

    fn status(&mut self) -> Option<i32> {
        self.queue.peek_status(&self.clock, GATE_QUEUE_TIMEOUT_MS)
    }
}

/// Everything a handler may touch.
pub struct Dispatcher<'a, S: ?Sized, G: ?Sized> {
    pub registry: &'a mut Registry,
    pub settings: &'a Settings,
    pub store: &'a mut S,
    pub gate: &'a mut G,
}

/// Arguments after the command label.
fn argument<'t>(text: &'t [u8], command: &Command) -> &'t str {
    let rest = text.get(command.label.len()..).unwrap_or(&[]);
    core::str::from_utf8(rest).unwrap_or("").trim()
}

fn reply(text: &str) -> Reply {
    let mut out = Reply::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

impl<S: Store + ?Sized, G: GateLink + ?Sized> Dispatcher<'_, S, G> {
    pub fn role_of(&self, id: i64) -> Role {
        if self.registry.is_admin(id) {
            Role::Admin
        } else if self.registry.is_authorized(id) {
            Role::User
        } else {
            Role::Anonymous
        }
    }

    /// Handle one update. Returns `None` when the update carries no text.
    pub fn dispatch(&mut self, update: &ParsedUpdate<'_>) -> Option<Reply> {
        let message = &update.message;
        let text = message.text?;
        let caller = message.from.id_value().unwrap_or(0);

        let Some(command) = match_command(text) else {
            log::warn!(
                "dispatch: unknown command {:?} from {}",
                core::str::from_utf8(text).unwrap_or("<binary>"),
                caller
            );
            return Some(reply(UNKNOWN_COMMAND));
        };

        let role = self.role_of(caller);
        if role < command.role {
            log::warn!("dispatch: {} denied {} ({:?})", caller, command.label, role);
            return Some(reply(command.denied));
        }
        log::info!("dispatch: {} from {} ({:?})", command.label, caller, role);

        if role >= Role::User {
            if let Err(e) = self.registry.update_profile(self.store, &message.from) {
                log::warn!("dispatch: profile refresh for {} failed: {}", caller, e);
            }
        }

        let arg = argument(text, command);
        Some(self.run(command.action, caller, role, arg))
    }

    fn run(
        &mut self,
        action: Action,
        caller: i64,
        role: Role,
        arg: &str,
    ) -> Reply {
        match action {
            Action::Open(gate) => {
                let request = GateRequest::open(gate, self.settings.open_ms());
                let done = match gate {
                    Gate::Upper => "Upper gate has been opened",
                    Gate::Lower => "Lower gate has been opened",
                };
                self.submit(request, |out| out.push_str(done).map_err(|_| core::fmt::Error))
            }
            Action::OpenAndLock => {
                let lock_ms = self.settings.lock_ms();
                let request = GateRequest::open(Gate::Lower, lock_ms);
                self.submit(request, |out| {
                    write!(
                        out,
                        "Lower gate has been opened and locked for {} minutes. \
                         Don't forget to unlock it when you're done",
                        ticks::to_minutes(lock_ms)
                    )
                })
            }
            Action::Unlock => self.submit(GateRequest::unlock(Gate::Lower), |out| {
                out.push_str("Gate has been unlocked").map_err(|_| core::fmt::Error)
            }),
            Action::Status => self.status(),
            Action::Start => self.start(caller, role),
            Action::Help => reply(
                "Gate Keeper allows you to:\n\
                 - open upper gate\n\
                 - open lower gate\n\
                 - lock the lower gate opened and unlock later\n\
                 - get status of the lower gate.\n\n\
                 If you have any questions contact house committee.",
            ),
            Action::Settings => self.settings_report(role),
            Action::Add(table) => self.add_entry(table, arg),
            Action::Drop(table) => self.drop_entry(table, arg),
            Action::List(table) => self.list_entries(table),
            Action::Configure(setting) => self.configure(setting, arg),
        }
    }

    fn submit<F>(&mut self, request: GateRequest, done: F) -> Reply
    where
        F: FnOnce(&mut Reply) -> core::fmt::Result,
    {
        match self.gate.request(request) {
            Ok(()) => {
                let mut out = Reply::new();
                let _ = done(&mut out);
                out
            }
            Err(GateBusy) => reply(GATE_BUSY),
        }
    }

    fn status(&mut self) -> Reply {
        let mut out = Reply::new();
        match self.gate.status() {
            Some(status) if status < 0 => {
                let seconds = status.unsigned_abs() / 1000;
                let _ = write!(
                    out,
                    "Lower gate status: {} m {} s left till closing\n",
                    seconds / 60,
                    seconds % 60
                );
            }
            Some(_) => {
                let _ = out.push_str("Lower gate is closed");
            }
            None => {
                let _ = out.push_str("Lower gate status is unavailable");
            }
        }
        out
    }

    fn start(&self, caller: i64, role: Role) -> Reply {
        let mut out = Reply::new();
        if role == Role::Anonymous {
            let _ = write!(out, "{}. Your ID: {}", NOT_AUTHORIZED, caller);
            return out;
        }
        let _ = write!(
            out,
            "Welcome to Gate Keeper!\nHere you can:\n\
             - open upper and lower gates\n\
             - open and lock opened lower gate for {} minutes. \
             Don't forget to unlock it when you're done",
            ticks::to_minutes(self.settings.lock_ms())
        );
        out
    }

    fn settings_report(&self, role: Role) -> Reply {
        let s = self.settings;
        let mut out = Reply::new();
        let _ = write!(
            out,
            "Gate Keeper settings:\n- lower gate lock period: {} min",
            ticks::to_minutes(s.lock_ms())
        );
        if role == Role::Admin {
            let _ = write!(
                out,
                "\n- polling period (/cfggatepoll): {} msec\
                 \n- open pulse duration (/cfgopenpulseduration): {} msec\
                 \n- open cycle duration (/cfgopenduration): {} msec\
                 \n- lock period duration (/cfglockduration): {} msec\
                 \n- open level (/cfgopenlevel): {}",
                s.get(Setting::GatePoll),
                s.get(Setting::OpenPulseDuration),
                s.get(Setting::OpenDuration),
                s.get(Setting::LockDuration),
                level_name(s.open_level())
            );
        }
        out
    }

    fn add_entry(&mut self, table: Table, arg: &str) -> Reply {
        let result = match arg.parse::<i64>() {
            Ok(id) => self.registry.add(self.store, table, id).map(|_| ()),
            Err(_) => Err(RegistryError::WrongId),
        };
        let text = match (table, result) {
            (Table::Users, Ok(())) => "Added user",
            (Table::Admins, Ok(())) => "Added admin",
            (Table::Users, Err(RegistryError::AlreadyExists)) => "User exists",
            (Table::Admins, Err(RegistryError::AlreadyExists)) => "Admin exists",
            (Table::Users, Err(RegistryError::NoSpace)) => "Failed to add user: too many users",
            (Table::Admins, Err(RegistryError::NoSpace)) => "Failed to add admin: too many admins",
            (_, Err(RegistryError::WrongId)) => "Wrong ID",
            (_, Err(e)) => {
                log::error!("dispatch: add to {:?} failed: {}", table, e);
                "Unknown error"
            }
        };
        reply(text)
    }

    fn drop_entry(&mut self, table: Table, arg: &str) -> Reply {
        let id = match arg.parse::<i64>() {
            Ok(id) if is_valid_id(id) => id,
            _ => return reply("Wrong ID"),
        };
        let mut out = Reply::new();
        match (table, self.registry.drop(self.store, table, id)) {
            (Table::Users, Ok(())) => {
                let _ = write!(out, "Dropped user {}", id);
            }
            (Table::Admins, Ok(())) => {
                let _ = write!(out, "Dropped admin {}", id);
            }
            (_, Err(RegistryError::AdminFloor)) => {
                let _ = out.push_str("At least one admin should remain");
            }
            (Table::Users, Err(RegistryError::NotFound)) => {
                let _ = out.push_str("User not found");
            }
            (Table::Admins, Err(RegistryError::NotFound)) => {
                let _ = out.push_str("Admin not found");
            }
            (_, Err(e)) => {
                log::error!("dispatch: drop from {:?} failed: {}", table, e);
                let _ = out.push_str("Unknown error");
            }
        }
        out
    }

    fn list_entries(&self, table: Table) -> Reply {
        let mut out = Reply::new();
        // Leave room for the overflow note.
        let mut body: String<{ REPLY_LEN - 32 }> = String::new();
        match self.registry.list(table, &mut body) {
            Listing::Empty => {
                let _ = out.push_str(match table {
                    Table::Users => "No users",
                    Table::Admins => "No admins",
                });
            }
            Listing::Entries { shown, total } => {
                let _ = out.push_str(&body);
                if shown < total {
                    let _ = write!(out, "... and {} more", total - shown);
                }
            }
        }
        out
    }

    fn configure(&mut self, setting: Setting, arg: &str) -> Reply {
        let mut out = Reply::new();
        let label = setting_label(setting);

        if arg.is_empty() {
            let _ = match setting {
                Setting::OpenLevel => {
                    write!(out, "{}: {}", label, level_name(self.settings.open_level()))
                }
                _ => write!(out, "{}: {} msec", label, self.settings.get(setting)),
            };
            return out;
        }

        let result = match arg.parse::<u32>() {
            Ok(value) => self.settings.set(self.store, setting, value),
            Err(_) => {
                log::warn!("dispatch: bad value {:?} for {:?}", arg, setting);
                return reply(failure_text(setting));
            }
        };
        match result {
            Ok(()) => {
                let value = self.settings.get(setting);
                let _ = match setting {
                    Setting::OpenLevel => write!(out, "{} set {}", label, level_name(value != 0)),
                    _ => write!(out, "{} set {} msec", label, value),
                };
                out
            }
            Err(e) => {
                log::warn!("dispatch: {:?} not set: {}", setting, e);
                reply(failure_text(setting))
            }
        }
    }
}

fn setting_label(setting: Setting) -> &'static str {
    match setting {
        Setting::GatePoll => "Gate polling period",
        Setting::OpenPulseDuration => "Gate open pulse duration",
        Setting::OpenDuration => "Gate open cycle duration",
        Setting::LockDuration => "Gate lock period duration",
        Setting::OpenLevel => "Gate open level",
    }
}

fn failure_text(setting: Setting) -> &'static str {
    match setting {
        Setting::OpenLevel => "Failed to set level",
        _ => "Failed to set duration",
    }
}

fn level_name(high: bool) -> &'static str {
    if high {
        "high"
    } else {
        "low"
    }
}
