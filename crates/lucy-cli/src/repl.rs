//! REPL – Read-Eval-Print Loop for the Lucy operator console.
//!
//! Supported slash-commands:
//!   /connect [url]            – connect to the robot's rosbridge
//!   /reconnect [url]          – replace the connection
//!   /disconnect               – close the connection
//!   /status                   – connection and stream status
//!   /joints                   – list joints
//!   /set <joint> <degrees>    – move one joint
//!   /reset [category]         – move joints to the middle of their range
//!   /send on|off              – periodic joint-state publishing
//!   /camera on|off            – follow the camera stream
//!   /enable-camera on|off     – switch the robot camera
//!   /clients                  – toggle the connected-clients monitor
//!   /pose save|load <name>, /pose list, /pose export
//!   /help, /quit | /exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use lucy_bridge::{BridgeContext, ConnectedClientsMonitor, ConsumerId, PublishLoop};
use lucy_types::{
    BridgeError, ConnectionStatus, JointControlState, SavedPose, degrees_to_radians, radians_to_degrees,
};
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::config::{self, Config};

/// How long a blocking service command waits for the robot to answer.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

async fn within_service_timeout<T>(
    call: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, String> {
    match tokio::time::timeout(SERVICE_TIMEOUT, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!(
            "no response within {}s",
            SERVICE_TIMEOUT.as_secs()
        )),
    }
}

/// Parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(Option<String>),
    Reconnect(Option<String>),
    Disconnect,
    Status,
    Joints,
    Set { joint: String, degrees: f64 },
    Reset(Option<String>),
    Send(bool),
    Camera(bool),
    EnableCamera(bool),
    Clients,
    PoseSave(String),
    PoseLoad(String),
    PoseList,
    PoseExport,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("empty command".to_string());
        };
        let rest: Vec<&str> = words.collect();
        let tail = || (!rest.is_empty()).then(|| rest.join(" "));

        match head {
            "/connect" => Ok(Command::Connect(tail())),
            "/reconnect" => Ok(Command::Reconnect(tail())),
            "/disconnect" => Ok(Command::Disconnect),
            "/status" => Ok(Command::Status),
            "/joints" => Ok(Command::Joints),
            "/set" => match rest.as_slice() {
                [joint, degrees] => degrees
                    .parse::<f64>()
                    .map(|degrees| Command::Set {
                        joint: joint.to_string(),
                        degrees,
                    })
                    .map_err(|_| format!("'{degrees}' is not a number")),
                _ => Err("usage: /set <joint> <degrees>".to_string()),
            },
            "/reset" => Ok(Command::Reset(tail())),
            "/send" => on_off(&rest).map(Command::Send),
            "/camera" => on_off(&rest).map(Command::Camera),
            "/enable-camera" => on_off(&rest).map(Command::EnableCamera),
            "/clients" => Ok(Command::Clients),
            "/pose" => match rest.as_slice() {
                ["save", name @ ..] if !name.is_empty() => Ok(Command::PoseSave(name.join(" "))),
                ["load", name @ ..] if !name.is_empty() => Ok(Command::PoseLoad(name.join(" "))),
                ["list"] => Ok(Command::PoseList),
                ["export"] => Ok(Command::PoseExport),
                _ => Err("usage: /pose save <name> | load <name> | list | export".to_string()),
            },
            "/help" => Ok(Command::Help),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command: '{other}'")),
        }
    }
}

fn on_off(rest: &[&str]) -> Result<bool, String> {
    match rest {
        [arg] => config::parse_flag(arg).ok_or_else(|| format!("expected on|off, got '{arg}'")),
        _ => Err("expected on|off".to_string()),
    }
}

/// The right arm and hand, as exposed by the robot description.
pub fn default_joints() -> Vec<JointControlState> {
    const MAX: f64 = 2.617994;
    let arm = [
        "right_shoulder_yaw_joint",
        "right_shoulder_roll_joint",
        "right_elbow_joint",
        "right_wrist_joint",
    ];
    let hand = [
        "right_thumb_joint",
        "right_index_joint",
        "right_middle_joint",
        "right_ring_joint",
        "right_pinky_joint",
    ];
    arm.iter()
        .map(|name| JointControlState::revolute(*name, "Right Arm", 0.0, MAX))
        .chain(
            hand.iter()
                .map(|name| JointControlState::revolute(*name, "Right Hand", 0.0, MAX)),
        )
        .collect()
}

/// Set `joint` to `degrees`, clamped to its limits. Returns the applied
/// value in degrees.
pub fn set_joint(joints: &mut [JointControlState], joint: &str, degrees: f64) -> Option<f64> {
    let j = joints.iter_mut().find(|j| j.name == joint)?;
    j.set_value(degrees_to_radians(degrees));
    Some(radians_to_degrees(j.current_value))
}

/// Reset every joint, or only those in `category` (case-insensitive).
/// Returns how many joints moved.
pub fn reset_joints(joints: &mut [JointControlState], category: Option<&str>) -> usize {
    let mut n = 0;
    for j in joints
        .iter_mut()
        .filter(|j| category.is_none_or(|c| j.category.eq_ignore_ascii_case(c)))
    {
        j.reset();
        n += 1;
    }
    n
}

struct Session {
    cfg: Config,
    ctx: Arc<BridgeContext>,
    rt: Arc<Runtime>,
    joints: Vec<JointControlState>,
    joints_tx: watch::Sender<Vec<JointControlState>>,
    publish_loop: Option<PublishLoop>,
    camera: Option<ConsumerId>,
    frames_seen: Arc<AtomicU64>,
    clients: Option<ConnectedClientsMonitor>,
    poses: Vec<SavedPose>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(cfg: Config, ctx: Arc<BridgeContext>, rt: Arc<Runtime>, shutdown: Arc<AtomicBool>) {
    let _enter = rt.enter();
    let joints = default_joints();
    let (joints_tx, _) = watch::channel(joints.clone());
    let mut session = Session {
        cfg,
        ctx,
        rt: Arc::clone(&rt),
        joints,
        joints_tx,
        publish_loop: None,
        camera: None,
        frames_seen: Arc::new(AtomicU64::new(0)),
        clients: None,
        poses: Vec::new(),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", prompt(session.ctx.manager().status()));
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        match Command::parse(cmd) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => session.execute(command),
            Err(e) => println!(
                "{} Type {} for available commands.",
                e.red(),
                "/help".bold()
            ),
        }
    }

    session.ctx.manager().disconnect();
}

fn prompt(status: ConnectionStatus) -> colored::ColoredString {
    match status {
        ConnectionStatus::Connected => "lucy●>".bold().green(),
        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => "lucy◌>".bold().yellow(),
        ConnectionStatus::Disconnected => "lucy>".bold().cyan(),
    }
}

impl Session {
    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect(url) => self.cmd_connect(url, false),
            Command::Reconnect(url) => self.cmd_connect(url, true),
            Command::Disconnect => {
                self.ctx.manager().disconnect();
                println!("{}", "Disconnected.".green());
            }
            Command::Status => self.cmd_status(),
            Command::Joints => self.cmd_joints(),
            Command::Set { joint, degrees } => match set_joint(&mut self.joints, &joint, degrees) {
                Some(applied) => {
                    println!("  {} → {:.1}°", joint.bold(), applied);
                    self.joints_changed();
                }
                None => println!("{} '{}'", "Unknown joint:".red(), joint.yellow()),
            },
            Command::Reset(category) => {
                let n = reset_joints(&mut self.joints, category.as_deref());
                println!("  Reset {} joint(s).", n);
                if n > 0 {
                    self.joints_changed();
                }
            }
            Command::Send(on) => self.cmd_send(on),
            Command::Camera(on) => self.cmd_camera(on),
            Command::EnableCamera(on) => {
                let call = self.ctx.enable_camera().enable_camera(on);
                match self.rt.block_on(within_service_timeout(call)) {
                    Ok(_) => println!(
                        "{} Camera {}",
                        "✓".green().bold(),
                        if on { "enabled" } else { "disabled" }
                    ),
                    Err(e) => println!("{}: {}", "Camera service error".red(), e),
                }
            }
            Command::Clients => self.cmd_clients(),
            Command::PoseSave(name) => {
                let pose = SavedPose::capture(&name, &self.joints, None);
                self.poses.retain(|p| p.name != pose.name);
                println!("{} Saved pose {}", "✓".green().bold(), pose.name.bold());
                self.poses.push(pose);
            }
            Command::PoseLoad(name) => {
                match self.poses.iter().find(|p| p.name == name.trim()) {
                    Some(pose) => {
                        pose.apply_to(&mut self.joints);
                        println!("{} Loaded pose {}", "✓".green().bold(), pose.name.bold());
                        self.joints_changed();
                    }
                    None => println!("{} '{}'", "Unknown pose:".red(), name.yellow()),
                }
            }
            Command::PoseList => {
                if self.poses.is_empty() {
                    println!("  {}", "No saved poses.".dimmed());
                }
                for pose in &self.poses {
                    println!(
                        "  {}  {}  ({} joints)",
                        pose.name.bold(),
                        pose.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                        pose.joints.len()
                    );
                }
            }
            Command::PoseExport => match serde_json::to_string_pretty(&self.poses) {
                Ok(json) => println!("{json}"),
                Err(e) => println!("{}: {}", "Export failed".red(), e),
            },
            Command::Help => cmd_help(),
            Command::Quit => {}
        }
    }

    fn cmd_connect(&mut self, url: Option<String>, reconnect: bool) {
        let url = url.unwrap_or_else(|| self.cfg.preferred_url().to_string());
        print!("  {} {} … ", if reconnect { "Reconnecting to" } else { "Connecting to" }, url.bold());
        io::stdout().flush().ok();

        let manager = self.ctx.manager();
        let result = if reconnect {
            self.rt.block_on(manager.reconnect(&url))
        } else {
            self.rt.block_on(manager.connect(&url))
        };
        match result {
            Ok(()) => {
                println!("{}", "connected".green());
                self.cfg.last_url = Some(url.clone());
                if let Err(e) = config::remember_url(&url) {
                    println!("  {}: {}", "Could not save URL".yellow(), e);
                }
            }
            Err(e) => println!("{} ({})", "failed".red(), e),
        }
    }

    fn cmd_status(&self) {
        let manager = self.ctx.manager();
        let status = manager.status();
        let status_str = match status {
            ConnectionStatus::Connected => status.to_string().green(),
            ConnectionStatus::Disconnected => status.to_string().red(),
            _ => status.to_string().yellow(),
        };
        println!("{}", "Bridge Status".bold().underline());
        println!("  Status   : {}", status_str);
        let url = manager.url();
        println!("  URL      : {}", if url.is_empty() { "-".to_string() } else { url });
        println!(
            "  Sending  : {}",
            if self.publish_loop.is_some() { "on".green() } else { "off".dimmed() }
        );
        let camera = self.ctx.camera();
        if self.camera.is_some() {
            let metrics = camera.metrics();
            println!(
                "  Camera   : {} ({} frames, {} fps, {:.1} ms delay)",
                if camera.is_subscribed() { "streaming".green() } else { "waiting".yellow() },
                self.frames_seen.load(Ordering::Relaxed),
                metrics.fps,
                metrics.frame_delay_ms
            );
        } else {
            println!("  Camera   : {}", "off".dimmed());
        }
        println!(
            "  Clients  : {}",
            if self.clients.is_some() { "monitoring".green() } else { "off".dimmed() }
        );
    }

    fn cmd_joints(&self) {
        let mut category = "";
        for joint in &self.joints {
            if joint.category != category {
                category = joint.category.as_str();
                println!("{}", category.bold().underline());
            }
            println!(
                "  {:<28} {:>7.1}°  [{:.0}°, {:.0}°]",
                joint.name,
                radians_to_degrees(joint.current_value),
                radians_to_degrees(joint.min_value),
                radians_to_degrees(joint.max_value)
            );
        }
    }

    fn cmd_send(&mut self, on: bool) {
        if on {
            if self.publish_loop.is_none() {
                let period = Duration::from_millis(self.cfg.publish_interval_ms.max(1));
                self.publish_loop = Some(PublishLoop::spawn(
                    Arc::clone(self.ctx.joint_states()),
                    self.joints_tx.subscribe(),
                    period,
                ));
            }
            println!("{} Publishing joint states every {} ms", "✓".green().bold(), self.cfg.publish_interval_ms);
        } else {
            if let Some(publish_loop) = self.publish_loop.take() {
                publish_loop.stop();
            }
            println!("  Joint-state publishing stopped.");
        }
    }

    fn cmd_camera(&mut self, on: bool) {
        let camera = self.ctx.camera();
        match (on, self.camera) {
            (true, None) => {
                self.frames_seen.store(0, Ordering::Relaxed);
                let frames = Arc::clone(&self.frames_seen);
                self.camera = Some(camera.subscribe_to_camera(move |_| {
                    frames.fetch_add(1, Ordering::Relaxed);
                }));
                println!("{} Following {}", "✓".green().bold(), camera.endpoint().name.bold());
            }
            (false, Some(id)) => {
                camera.unsubscribe_from_camera(id);
                self.camera = None;
                println!("  Camera stream released.");
            }
            _ => println!("  Camera already {}.", if on { "on" } else { "off" }),
        }
    }

    fn cmd_clients(&mut self) {
        if let Some(monitor) = self.clients.take() {
            monitor.stop();
            println!("  Connected-clients monitor stopped.");
            return;
        }
        self.clients = Some(self.ctx.monitor_connected_clients(|count| {
            println!("\n  {} {}", "Connected clients:".bold(), count.to_string().cyan());
        }));
        println!("{} Monitoring connected clients.", "✓".green().bold());
    }

    /// Push the joint vector to the publish loop, or publish once when the
    /// loop is not running.
    fn joints_changed(&self) {
        self.joints_tx.send_replace(self.joints.clone());
        if self.publish_loop.is_none() {
            self.ctx.joint_states().publish_joint_states(&self.joints);
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Lucy Commands".bold().underline());
    println!("  {}  – connect to rosbridge", "/connect [url]".bold().cyan());
    println!("  {}  – replace the connection", "/reconnect [url]".bold().cyan());
    println!("  {}  – close the connection", "/disconnect".bold().cyan());
    println!("  {}  – connection and stream status", "/status".bold().cyan());
    println!("  {}  – list joints", "/joints".bold().cyan());
    println!("  {}  – move one joint", "/set <joint> <degrees>".bold().cyan());
    println!("  {}  – centre joints", "/reset [category]".bold().cyan());
    println!("  {}  – periodic joint-state publishing", "/send on|off".bold().cyan());
    println!("  {}  – follow the camera stream", "/camera on|off".bold().cyan());
    println!("  {}  – switch the robot camera", "/enable-camera on|off".bold().cyan());
    println!("  {}  – toggle connected-clients monitor", "/clients".bold().cyan());
    println!("  {}  – saved poses", "/pose save|load <name>, /pose list|export".bold().cyan());
    println!("  {}  – exit", "/quit  /exit".bold().cyan());
    println!();
}
