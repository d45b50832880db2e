// Proctoring Server CLI Validation Tool
// Exercises the signaling, violation, and event-feed endpoints of a running server

use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctoring Server CLI Validation Tool", long_about = None)]
struct Cli {
    /// Server address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Get server configuration
    Config,

    /// Join a signaling channel
    Join {
        /// Channel (exam code) to join
        #[arg(short, long)]
        channel: String,

        /// Peer ID
        #[arg(short, long)]
        peer_id: String,
    },

    /// Leave a signaling channel
    Leave {
        #[arg(short, long)]
        channel: String,

        #[arg(short, long)]
        peer_id: String,
    },

    /// Post a signaling message to a channel
    Send {
        #[arg(short, long)]
        channel: String,

        /// Sender peer ID
        #[arg(short, long)]
        from: String,

        /// Recipient peer ID (omit to broadcast)
        #[arg(short, long)]
        to: Option<String>,

        /// Message kind (offer, answer, ice-candidate)
        #[arg(short, long, default_value = "offer")]
        kind: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Poll undelivered messages for a peer
    Poll {
        #[arg(short, long)]
        channel: String,

        #[arg(short, long)]
        peer_id: String,
    },

    /// Show channel statistics
    Stats {
        #[arg(short, long)]
        channel: String,
    },

    /// Report a violation for a student
    Violate {
        #[arg(short, long)]
        exam: String,

        #[arg(short, long)]
        student: String,

        /// Violation kind (e.g. tab-switch, fullscreen-exit)
        #[arg(short, long)]
        kind: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Resolve a previously reported violation
    Resolve {
        #[arg(short, long)]
        exam: String,

        #[arg(short, long)]
        student: String,

        #[arg(short, long)]
        kind: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Clear all violations for a student
    Clear {
        #[arg(short, long)]
        exam: String,

        #[arg(short, long)]
        student: String,
    },

    /// Show countdown status for a student
    Status {
        #[arg(short, long)]
        exam: String,

        #[arg(short, long)]
        student: String,
    },

    /// Attach to a channel's event feed over WebSocket and print everything
    Watch {
        #[arg(short, long)]
        channel: String,

        #[arg(short, long)]
        peer_id: String,
    },

    /// Run automated validation scenarios
    Validate {
        /// Run all validation tests
        #[arg(short, long)]
        all: bool,

        /// Test specific scenario
        #[arg(short, long)]
        scenario: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Config => check_config(&cli.server).await,
        Commands::Join { channel, peer_id } => {
            membership(&cli.server, channel, peer_id, "join").await;
        }
        Commands::Leave { channel, peer_id } => {
            membership(&cli.server, channel, peer_id, "leave").await;
        }
        Commands::Send {
            channel,
            from,
            to,
            kind,
            payload,
        } => {
            send_message(&cli.server, channel, from, to.as_deref(), kind, payload).await;
        }
        Commands::Poll { channel, peer_id } => {
            poll_messages(&cli.server, channel, peer_id).await;
        }
        Commands::Stats { channel } => {
            get_json(&cli.server, &format!("proctor/channels/{}/stats", channel)).await;
        }
        Commands::Violate {
            exam,
            student,
            kind,
            description,
        } => {
            violation(&cli.server, exam, student, kind, description, true).await;
        }
        Commands::Resolve {
            exam,
            student,
            kind,
            description,
        } => {
            violation(&cli.server, exam, student, kind, description, false).await;
        }
        Commands::Clear { exam, student } => {
            clear_violations(&cli.server, exam, student).await;
        }
        Commands::Status { exam, student } => {
            get_json(
                &cli.server,
                &format!("proctor/exams/{}/students/{}/status", exam, student),
            )
            .await;
        }
        Commands::Watch { channel, peer_id } => {
            watch_events(&cli.server, channel, peer_id).await;
        }
        Commands::Validate { all, scenario } => {
            if *all {
                run_all_validations(&cli.server).await;
            } else if let Some(s) = scenario {
                run_scenario(&cli.server, s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/proctor/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching server configuration...".cyan());

    let url = format!("http://{}/proctor/config", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                println!("{} Config endpoint accessible", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("\nConfiguration:");
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&body)
                            .unwrap_or_else(|_| body.to_string())
                    );
                }
            } else {
                println!("{} Config fetch failed: {}", "✗".red(), resp.status());
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn membership(server: &str, channel: &str, peer_id: &str, action: &str) {
    let url = format!("http://{}/proctor/channels/{}/{}", server, channel, action);
    let client = reqwest::Client::new();

    match client
        .post(&url)
        .json(&json!({ "peer_id": peer_id }))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            println!("{} {} {} on channel {}", "✓".green(), peer_id, action, channel);
        }
        Ok(resp) => {
            println!("{} Request failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn send_message(
    server: &str,
    channel: &str,
    from: &str,
    to: Option<&str>,
    kind: &str,
    payload: &str,
) {
    let payload: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            println!("{} Invalid JSON payload: {}", "✗".red(), e);
            return;
        }
    };

    let url = format!("http://{}/proctor/channels/{}/send", server, channel);
    let client = reqwest::Client::new();

    let body = json!({
        "from": from,
        "to": to,
        "kind": kind,
        "payload": payload,
    });

    match client.post(&url).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            if let Ok(message) = resp.json::<serde_json::Value>().await {
                println!("{} Message posted", "✓".green());
                println!("  ID: {}", message["id"].as_str().unwrap_or("unknown"));
            }
        }
        Ok(resp) => {
            println!("{} Send failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn poll_messages(server: &str, channel: &str, peer_id: &str) {
    let url = format!(
        "http://{}/proctor/channels/{}/poll?peer_id={}",
        server,
        channel,
        urlencoding::encode(peer_id)
    );
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            if let Ok(messages) = resp.json::<Vec<serde_json::Value>>().await {
                println!("{} {} message(s) delivered", "✓".green(), messages.len());
                for message in messages {
                    println!(
                        "  {} {} from {}",
                        "◀".green(),
                        message["kind"].as_str().unwrap_or("?"),
                        message["from"].as_str().unwrap_or("?")
                    );
                }
            }
        }
        Ok(resp) => {
            println!("{} Poll failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn get_json(server: &str, path: &str) {
    let url = format!("http://{}/{}", server, path);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&body)
                        .unwrap_or_else(|_| body.to_string())
                );
            }
        }
        Ok(resp) => {
            println!("{} Request failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn violation(
    server: &str,
    exam: &str,
    student: &str,
    kind: &str,
    description: &str,
    add: bool,
) {
    let url = format!(
        "http://{}/proctor/exams/{}/students/{}/violations",
        server, exam, student
    );
    let client = reqwest::Client::new();
    let body = json!({ "kind": kind, "description": description });

    let request = if add {
        client.post(&url)
    } else {
        client.delete(&url)
    };

    match request.json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            let verb = if add { "reported" } else { "resolved" };
            println!("{} Violation {} ({})", "✓".green(), verb, kind);

            if let Ok(status) = resp.json::<serde_json::Value>().await {
                print_countdown_status(&status);
            }
        }
        Ok(resp) => {
            println!("{} Request failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn clear_violations(server: &str, exam: &str, student: &str) {
    let url = format!(
        "http://{}/proctor/exams/{}/students/{}/violations/all",
        server, exam, student
    );
    let client = reqwest::Client::new();

    match client.delete(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} All violations cleared", "✓".green());
            if let Ok(status) = resp.json::<serde_json::Value>().await {
                print_countdown_status(&status);
            }
        }
        Ok(resp) => {
            println!("{} Request failed: {}", "✗".red(), resp.status());
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

fn print_countdown_status(status: &serde_json::Value) {
    let active = status["is_countdown_active"].as_bool().unwrap_or(false);
    let remaining = status["remaining_seconds"].as_u64().unwrap_or(0);
    let count = status["violation_count"].as_u64().unwrap_or(0);

    if active {
        let line = format!("Countdown active: {}s remaining", remaining);
        if status["final_warning"].as_bool().unwrap_or(false) {
            println!("  {}", line.red().bold());
        } else {
            println!("  {}", line.yellow());
        }
    } else {
        println!("  Countdown idle");
    }
    println!("  Active violations: {}", count);
}

async fn watch_events(server: &str, channel: &str, peer_id: &str) {
    println!("{}", "Attaching to event feed...".cyan());

    let url = format!(
        "ws://{}/proctor/events/{}/{}",
        server,
        urlencoding::encode(channel),
        urlencoding::encode(peer_id)
    );

    match connect_async(&url).await {
        Ok((ws_stream, _)) => {
            println!("{} Connected to {}", "✓".green(), url);
            println!("Press {} to stop.\n", "Ctrl+C".bold());

            let (_, mut read) = ws_stream.split();

            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    println!("{} {}", "◀".green(), text.bright_white());
                }
            }

            println!("{} Connection closed", "✗".yellow());
        }
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
        }
    }
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    println!("\n{}", "Signaling:".bold().cyan());
    println!("  {} - Health and config endpoints", "health".cyan());
    println!("  {} - Broadcast message reaches other members", "roundtrip".cyan());
    println!("  {} - Polling twice delivers each message once", "dedup".cyan());
    println!("  {} - Targeted message skips other peers", "targeted".cyan());
    println!("\n{}", "Violations:".bold().cyan());
    println!("  {} - Violation starts the countdown", "countdown-start".cyan());
    println!("  {} - Clearing violations resets the countdown", "countdown-clear".cyan());
    println!("  {} - Countdown expiry submits the exam", "countdown-expiry".cyan());
    println!("\nExample: proctor-cli validate --scenario roundtrip");
}

async fn run_scenario(server: &str, scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    let result = dispatch_scenario(server, scenario).await;

    match result {
        Some(true) => println!("\n{} Scenario passed", "✓".green().bold()),
        Some(false) => println!("\n{} Scenario failed", "✗".red().bold()),
        None => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
        }
    }
}

async fn dispatch_scenario(server: &str, scenario: &str) -> Option<bool> {
    let result = match scenario {
        "health" => validate_health(server).await,
        "roundtrip" => validate_roundtrip(server).await,
        "dedup" => validate_dedup(server).await,
        "targeted" => validate_targeted(server).await,
        "countdown-start" => validate_countdown_start(server).await,
        "countdown-clear" => validate_countdown_clear(server).await,
        "countdown-expiry" => validate_countdown_expiry(server).await,
        _ => return None,
    };
    Some(result)
}

async fn run_all_validations(server: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let scenarios = vec![
        "health",
        "roundtrip",
        "dedup",
        "targeted",
        "countdown-start",
        "countdown-clear",
        "countdown-expiry",
    ];

    let mut passed = 0;
    let mut failed = 0;

    for scenario in scenarios {
        println!("\n{} Testing: {}", "▶".cyan(), scenario.bold());
        println!("{}", "─".repeat(60));

        if dispatch_scenario(server, scenario).await.unwrap_or(false) {
            passed += 1;
        } else {
            failed += 1;
        }

        sleep(Duration::from_millis(500)).await;
    }

    println!("\n{}", "═".repeat(60).green());
    println!("{}", "Validation Summary".bold());
    println!("{}", "═".repeat(60).green());
    println!("  {} Passed: {}", "✓".green(), passed.to_string().green());
    println!("  {} Failed: {}", "✗".red(), failed.to_string().red());
    println!("  Total: {}", passed + failed);

    if failed == 0 {
        println!("\n{}", "All validations passed! 🎉".green().bold());
    } else {
        println!("\n{}", "Some validations failed. Check output above.".yellow());
    }
}

async fn validate_health(server: &str) -> bool {
    let client = reqwest::Client::new();

    let health = format!("http://{}/proctor/health", server);
    match client.get(&health).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} Health endpoint OK", "✓".green());
        }
        _ => {
            println!("{} Health endpoint unreachable", "✗".red());
            return false;
        }
    }

    let config = format!("http://{}/proctor/config", server);
    match client.get(&config).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} Config endpoint OK", "✓".green());
            true
        }
        _ => {
            println!("{} Config endpoint unreachable", "✗".red());
            false
        }
    }
}

async fn join(client: &reqwest::Client, server: &str, channel: &str, peer: &str) -> bool {
    let url = format!("http://{}/proctor/channels/{}/join", server, channel);
    matches!(
        client.post(&url).json(&json!({ "peer_id": peer })).send().await,
        Ok(resp) if resp.status().is_success()
    )
}

async fn post_offer(client: &reqwest::Client, server: &str, channel: &str, from: &str, to: Option<&str>) -> bool {
    let url = format!("http://{}/proctor/channels/{}/send", server, channel);
    let body = json!({
        "from": from,
        "to": to,
        "kind": "offer",
        "payload": { "sdp": { "type": "offer", "sdp": "v=0\r\n" } },
    });
    matches!(
        client.post(&url).json(&body).send().await,
        Ok(resp) if resp.status().is_success()
    )
}

async fn poll(client: &reqwest::Client, server: &str, channel: &str, peer: &str) -> Vec<serde_json::Value> {
    let url = format!(
        "http://{}/proctor/channels/{}/poll?peer_id={}",
        server,
        channel,
        urlencoding::encode(peer)
    );
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            resp.json::<Vec<serde_json::Value>>().await.unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

async fn validate_roundtrip(server: &str) -> bool {
    let client = reqwest::Client::new();
    let channel = format!("cli-roundtrip-{}", std::process::id());

    if !join(&client, server, &channel, "cli-receiver").await {
        println!("{} Failed to join channel", "✗".red());
        return false;
    }
    println!("  {} Receiver joined {}", "✓".green(), channel);

    // Posting does not require membership
    if !post_offer(&client, server, &channel, "cli-sender", None).await {
        println!("{} Failed to post message", "✗".red());
        return false;
    }

    let received = poll(&client, server, &channel, "cli-receiver").await;
    let unregistered = poll(&client, server, &channel, "cli-sender").await;

    if received.len() == 1 && unregistered.is_empty() {
        println!("{} Receiver got the message, unregistered peer got nothing", "✓".green());
        true
    } else {
        println!(
            "{} Expected 1 message for receiver and 0 for the unregistered peer, got {} and {}",
            "✗".red(),
            received.len(),
            unregistered.len()
        );
        false
    }
}

async fn validate_dedup(server: &str) -> bool {
    let client = reqwest::Client::new();
    let channel = format!("cli-dedup-{}", std::process::id());

    if !join(&client, server, &channel, "cli-a").await
        || !join(&client, server, &channel, "cli-b").await
    {
        println!("{} Failed to join channel", "✗".red());
        return false;
    }

    if !post_offer(&client, server, &channel, "cli-a", None).await {
        println!("{} Failed to post message", "✗".red());
        return false;
    }

    let first = poll(&client, server, &channel, "cli-b").await;
    let second = poll(&client, server, &channel, "cli-b").await;

    if first.len() == 1 && second.is_empty() {
        println!("{} Second poll delivered nothing", "✓".green());
        true
    } else {
        println!(
            "{} Expected 1 then 0 messages, got {} then {}",
            "✗".red(),
            first.len(),
            second.len()
        );
        false
    }
}

async fn validate_targeted(server: &str) -> bool {
    let client = reqwest::Client::new();
    let channel = format!("cli-targeted-{}", std::process::id());

    for peer in ["cli-from", "cli-target", "cli-bystander"] {
        if !join(&client, server, &channel, peer).await {
            println!("{} Failed to join channel", "✗".red());
            return false;
        }
    }

    if !post_offer(&client, server, &channel, "cli-from", Some("cli-target")).await {
        println!("{} Failed to post message", "✗".red());
        return false;
    }

    let target = poll(&client, server, &channel, "cli-target").await;
    let bystander = poll(&client, server, &channel, "cli-bystander").await;

    if target.len() == 1 && bystander.is_empty() {
        println!("{} Only the addressed peer received the message", "✓".green());
        true
    } else {
        println!(
            "{} Expected 1 message for target and 0 for bystander, got {} and {}",
            "✗".red(),
            target.len(),
            bystander.len()
        );
        false
    }
}

async fn countdown_status(client: &reqwest::Client, server: &str, exam: &str, student: &str) -> serde_json::Value {
    let url = format!(
        "http://{}/proctor/exams/{}/students/{}/status",
        server, exam, student
    );
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            resp.json::<serde_json::Value>().await.unwrap_or_default()
        }
        _ => serde_json::Value::Null,
    }
}

async fn report(client: &reqwest::Client, server: &str, exam: &str, student: &str, kind: &str) -> bool {
    let url = format!(
        "http://{}/proctor/exams/{}/students/{}/violations",
        server, exam, student
    );
    matches!(
        client
            .post(&url)
            .json(&json!({ "kind": kind, "description": "cli validation" }))
            .send()
            .await,
        Ok(resp) if resp.status().is_success()
    )
}

async fn validate_countdown_start(server: &str) -> bool {
    let client = reqwest::Client::new();
    let exam = format!("cli-exam-{}", std::process::id());

    if !report(&client, server, &exam, "cli-student", "tab-switch").await {
        println!("{} Failed to report violation", "✗".red());
        return false;
    }

    let status = countdown_status(&client, server, &exam, "cli-student").await;
    let active = status["is_countdown_active"].as_bool().unwrap_or(false);
    let remaining = status["remaining_seconds"].as_u64().unwrap_or(0);

    if active && remaining > 0 && remaining <= 7 {
        println!("{} Countdown started at {}s", "✓".green(), remaining);
        true
    } else {
        println!("{} Countdown did not start: {}", "✗".red(), status);
        false
    }
}

async fn validate_countdown_clear(server: &str) -> bool {
    let client = reqwest::Client::new();
    let exam = format!("cli-exam-clear-{}", std::process::id());

    if !report(&client, server, &exam, "cli-student", "fullscreen-exit").await {
        println!("{} Failed to report violation", "✗".red());
        return false;
    }

    sleep(Duration::from_secs(2)).await;

    let url = format!(
        "http://{}/proctor/exams/{}/students/cli-student/violations/all",
        server, exam
    );
    if !matches!(client.delete(&url).send().await, Ok(resp) if resp.status().is_success()) {
        println!("{} Failed to clear violations", "✗".red());
        return false;
    }

    let status = countdown_status(&client, server, &exam, "cli-student").await;
    let active = status["is_countdown_active"].as_bool().unwrap_or(true);
    let remaining = status["remaining_seconds"].as_u64().unwrap_or(0);

    if !active && remaining == 7 {
        println!("{} Countdown stopped and reset to 7s", "✓".green());
        true
    } else {
        println!("{} Countdown not reset: {}", "✗".red(), status);
        false
    }
}

async fn validate_countdown_expiry(server: &str) -> bool {
    let client = reqwest::Client::new();
    let exam = format!("cli-exam-expiry-{}", std::process::id());

    if !report(&client, server, &exam, "cli-student", "tab-switch").await {
        println!("{} Failed to report violation", "✗".red());
        return false;
    }

    println!("  Waiting for the countdown to run out...");
    let deadline = timeout(Duration::from_secs(10), async {
        loop {
            sleep(Duration::from_secs(1)).await;
            let status = countdown_status(&client, server, &exam, "cli-student").await;
            let active = status["is_countdown_active"].as_bool().unwrap_or(true);
            let count = status["violation_count"].as_u64().unwrap_or(1);
            if !active && count == 0 {
                return;
            }
        }
    })
    .await;

    match deadline {
        Ok(()) => {
            println!("{} Countdown expired, violations cleared, exam submitted", "✓".green());
            true
        }
        Err(_) => {
            println!("{} Countdown did not expire within 10s", "✗".red());
            false
        }
    }
}
