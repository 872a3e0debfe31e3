//! bus-ctl — command-line interface for the bus daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};

use bus_core::codec::ByteOrder;
use bus_core::Value;
use libbus::Connection;

const DEFAULT_SOCKET_ENV: &str = "BUS_SOCKET";

fn default_socket_path() -> PathBuf {
    std::env::var(DEFAULT_SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("bus.sock"))
}

fn print_usage() {
    println!("Usage: bus-ctl [--socket <path>] <command>");
    println!();
    println!("Names");
    println!("  list-names                          List all names known to the bus");
    println!("  name-has-owner <name>                Check whether a name has an owner");
    println!("  get-name-owner <name>                Unique name owning a well-known name");
    println!();
    println!("Calls & Signals");
    println!("  call <dest> <path> <member> [arg...] Call a method, string arguments only");
    println!("  monitor [match-rule ...]             Print every signal matching the rules");
    println!();
    println!(
        "Options:\n  --socket <path>                   Bus socket (default: $BUS_SOCKET or {})",
        default_socket_path().display()
    );
    println!();
    println!("Examples:");
    println!("  bus-ctl list-names");
    println!("  bus-ctl call org.bus /org/bus ListNames");
    println!("  bus-ctl monitor \"type='signal'\"");
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut socket = default_socket_path();
    let mut remaining: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--socket" {
            i += 1;
            socket = PathBuf::from(args.get(i).context("--socket requires a value")?);
        } else {
            remaining.push(args[i].clone());
        }
        i += 1;
    }
    let remaining_refs: Vec<&str> = remaining.iter().map(|s| s.as_str()).collect();

    match remaining_refs.as_slice() {
        ["list-names"] => cmd_list_names(&socket),
        ["name-has-owner", name] => cmd_name_has_owner(&socket, name),
        ["get-name-owner", name] => cmd_get_name_owner(&socket, name),
        ["call", dest, path, member, rest @ ..] => cmd_call(&socket, dest, path, member, rest),
        ["monitor", rules @ ..] => cmd_monitor(&socket, rules),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn decode_first_string(msg: &bus_core::Message) -> Result<String> {
    let sig = msg.header.fields.signature.as_deref().unwrap_or("");
    let values = bus_core::reader::decode_body(msg.header.order, sig, &msg.body)?;
    match values.first() {
        Some(Value::Str(s)) => Ok(s.clone()),
        other => anyhow::bail!("expected a string reply, got {other:?}"),
    }
}

fn cmd_list_names(socket: &std::path::Path) -> Result<()> {
    let mut conn = Connection::open(socket).context("connecting to bus")?;
    let reply = conn.call("org.bus", "/org/bus", Some("org.bus"), "ListNames", None, Vec::new())?;
    let sig = reply.header.fields.signature.as_deref().unwrap_or("");
    let values = bus_core::reader::decode_body(reply.header.order, sig, &reply.body)?;
    if let Some(Value::Array(_, names)) = values.first() {
        for name in names {
            if let Value::Str(s) = name {
                println!("{s}");
            }
        }
    }
    Ok(())
}

fn cmd_name_has_owner(socket: &std::path::Path, name: &str) -> Result<()> {
    let mut conn = Connection::open(socket).context("connecting to bus")?;
    let body = bus_core::writer::encode_body(ByteOrder::Little, &[Value::Str(name.to_string())])?;
    let reply = conn.call("org.bus", "/org/bus", Some("org.bus"), "NameHasOwner", Some("s"), body)?;
    let sig = reply.header.fields.signature.as_deref().unwrap_or("");
    let values = bus_core::reader::decode_body(reply.header.order, sig, &reply.body)?;
    match values.first() {
        Some(Value::Bool(b)) => println!("{b}"),
        other => anyhow::bail!("expected a boolean reply, got {other:?}"),
    }
    Ok(())
}

fn cmd_get_name_owner(socket: &std::path::Path, name: &str) -> Result<()> {
    let mut conn = Connection::open(socket).context("connecting to bus")?;
    let body = bus_core::writer::encode_body(ByteOrder::Little, &[Value::Str(name.to_string())])?;
    let reply = conn.call("org.bus", "/org/bus", Some("org.bus"), "GetNameOwner", Some("s"), body)?;
    println!("{}", decode_first_string(&reply)?);
    Ok(())
}

/// Every argument after `member` is sent as a plain string (signature
/// `"sss..."`); bus-ctl doesn't parse typed argument syntax like
/// `int32:5`, only what a quick manual test needs.
fn cmd_call(socket: &std::path::Path, dest: &str, path: &str, member: &str, args: &[String]) -> Result<()> {
    let mut conn = Connection::open(socket).context("connecting to bus")?;
    let (signature, body) = if args.is_empty() {
        (None, Vec::new())
    } else {
        let sig = "s".repeat(args.len());
        let values: Vec<Value> = args.iter().map(|a| Value::Str(a.clone())).collect();
        let body = bus_core::writer::encode_body(ByteOrder::Little, &values)?;
        (Some(sig), body)
    };
    let reply = conn.call(dest, path, None, member, signature.as_deref(), body)?;
    if let Some(sig) = reply.header.fields.signature.as_deref() {
        let values = bus_core::reader::decode_body(reply.header.order, sig, &reply.body)?;
        for v in values {
            println!("{v:?}");
        }
    }
    Ok(())
}

fn cmd_monitor(socket: &std::path::Path, rules: &[String]) -> Result<()> {
    let mut conn = Connection::open(socket).context("connecting to bus")?;
    if rules.is_empty() {
        conn.add_match("type='signal'")?;
    } else {
        for rule in rules {
            conn.add_match(rule)?;
        }
    }
    loop {
        let msg = conn.next_message()?;
        println!(
            "{:?} {}.{} -> {}",
            msg.header.message_type,
            msg.header.fields.interface.as_deref().unwrap_or(""),
            msg.header.fields.member.as_deref().unwrap_or(""),
            msg.header.fields.sender.as_deref().unwrap_or("")
        );
    }
}
