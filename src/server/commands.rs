//! Command parsing and handlers.
//!
//! Lines are `<command> <args>` with comma-separated arguments and no
//! quoting; the comma is a hard separator, which is why zone names may not
//! contain commas. Every command is answered with exactly one `OK -` or
//! `ERR -` acknowledgement line (plus any listing lines it produces).
//! Asynchronous subscription traffic is emitted elsewhere and clients
//! dispatch on the line prefix.

use std::sync::Arc;

use crate::lut;
use crate::server::client::{format_zone_info, Client};
use crate::server::ServerInner;
use crate::zone::ZONE_NAME_LENGTH;
use crate::zone::catalog::parse_value;
use crate::pipeline::{TILT_MAX, TILT_MIN};

/// Wire protocol version. Version 2 switched coordinates to millimeters.
const PROTOCOL_VERSION: u32 = 2;

/// App version embedded at build time.
const APP_VERSION: &str = env!("GIT_VERSION");

pub(crate) const COMMANDS: &[(&str, &str)] = &[
    ("bye", "Disconnects from the server."),
    ("ver", "Returns the server protocol version."),
    ("help", "Lists available commands."),
    ("addzone", "Adds a new global zone (name, xmin, ymin, zmin, xmax, ymax, zmax)."),
    ("setzone", "Sets a zone's parameters (name, all, xmin, ymin, zmin, xmax, ymax, zmax or name, [attr], value)."),
    ("rmzone", "Removes a global zone (name)."),
    ("clear", "Removes all global zones."),
    ("zones", "Lists all global zones."),
    ("sub", "Subscribe to global zone updates."),
    ("unsub", "Unsubscribe from global zone updates."),
    ("getdepth", "Grabs a single 11-bit packed depth image (increments subscription count if already subscribed)."),
    ("subdepth", "Subscribes to 11-bit packed depth data (count (optional, <=0 means forever))."),
    ("unsubdepth", "Unsubscribes from 11-bit packed depth data."),
    ("getbright", "Asynchronously returns the approximate brightness within each zone."),
    ("getvideo", "Grabs a single video image."),
    ("tilt", "Sets or returns the camera tilt in degrees from horizontal."),
    ("fps", "Returns the approximate frame rate (updated every 200ms)."),
    ("lut", "Returns the depth look-up table, or looks up an entry in the table."),
    ("sa", "Returns the surface area look-up table, or looks up an entry in the table."),
];

/// Parses one command line and runs its handler. The reply goes onto the
/// client's outbound queue.
pub(crate) fn dispatch(inner: &Arc<ServerInner>, client: &Arc<Client>, line: &str) {
    let (cmd, args) = match line.split_once(' ') {
        Some((c, a)) => (c, a),
        None => (line, ""),
    };
    let argc = if args.is_empty() { 0 } else { args.matches(',').count() + 1 };

    match cmd {
        "bye" => bye(client),
        "ver" => ver(client),
        "help" => help(client),
        "addzone" => addzone(inner, client, argc, args),
        "setzone" => setzone(inner, client, argc, args),
        "rmzone" => rmzone(inner, client, args),
        "clear" => clear(inner, client),
        "zones" => zones(inner, client),
        "sub" => sub(inner, client),
        "unsub" => unsub(client),
        "getdepth" => getdepth(client),
        "subdepth" => subdepth(client, argc, args),
        "unsubdepth" => unsubdepth(client),
        "getbright" => getbright(inner, client),
        "getvideo" => getvideo(inner, client),
        "tilt" => tilt(inner, client, argc, args),
        "fps" => fps(inner, client),
        "lut" => lut_cmd(client, argc, args),
        "sa" => sa_cmd(client, argc, args),
        _ => {
            tracing::debug!(client = %client.addr, command = %cmd, "Unknown command");
            client.send_str("ERR - Unknown command\n");
        }
    }
}

fn bye(client: &Arc<Client>) {
    client.send_str("OK - Goodbye\n");
    client.request_shutdown();
}

fn ver(client: &Arc<Client>) {
    client.send_str(format!("OK - Version {PROTOCOL_VERSION}\n"));
}

fn help(client: &Arc<Client>) {
    let mut out = format!(
        "OK - {} commands (app version {})\n",
        COMMANDS.len(),
        APP_VERSION
    );
    for (name, desc) in COMMANDS {
        out.push_str(name);
        out.push_str(" - ");
        out.push_str(desc);
        out.push('\n');
    }
    client.send_str(out);
}

/// Splits the leading name argument, enforcing the name length limit.
fn split_name(args: &str) -> Result<(&str, &str), String> {
    let (name, rest) = args.split_once(',').unwrap_or((args, ""));
    if name.len() > ZONE_NAME_LENGTH {
        return Err(format!(
            "ERR - Name is too long (limit is {} bytes, got {})\n",
            ZONE_NAME_LENGTH,
            name.len()
        ));
    }
    Ok((name, rest))
}

/// Parses exactly `fields.len()` strictly numeric values.
fn parse_coords(fields: &[&str]) -> Result<Vec<i32>, usize> {
    let mut out = Vec::with_capacity(fields.len());
    for (i, f) in fields.iter().enumerate() {
        match f.trim().parse::<i32>() {
            Ok(v) => out.push(v),
            Err(_) => return Err(i),
        }
    }
    Ok(out)
}

fn addzone(inner: &Arc<ServerInner>, client: &Arc<Client>, argc: usize, args: &str) {
    if argc != 7 {
        client.send_str(format!("ERR - Expected 7 parameters, got {argc}\n"));
        return;
    }

    let (name, rest) = match split_name(args) {
        Ok(v) => v,
        Err(e) => {
            client.send_str(e);
            return;
        }
    };

    let fields: Vec<&str> = rest.split(',').collect();
    let coords = match parse_coords(&fields) {
        Ok(c) => c,
        Err(n) => {
            client.send_str(format!(
                "ERR - Error parsing arguments (successfully parsed {} of 7)\n",
                n + 1
            ));
            return;
        }
    };

    match inner.ctx.catalog.add(name, [coords[0], coords[1], coords[2], coords[3], coords[4], coords[5]]) {
        Ok(()) => {
            client.send_str(format!("OK - Zone \"{name}\" was added.\n"));
            broadcast_addition(inner, name);
        }
        Err(e) => client.send_str(format!("ERR - {e}\n")),
    }
}

/// Announces a newly added zone to every subscribed client.
fn broadcast_addition(inner: &Arc<ServerInner>, name: &str) {
    let mut line = None;
    inner.ctx.catalog.for_each(|z| {
        if z.name == name {
            line = Some(format!("ADD - {}", format_zone_info(z, true)));
        }
    });
    let Some(line) = line else { return };
    for peer in inner.registry_snapshot() {
        if peer.subs().global {
            peer.send_str(line.clone());
        }
    }
}

fn setzone(inner: &Arc<ServerInner>, client: &Arc<Client>, argc: usize, args: &str) {
    if argc != 3 && argc != 8 {
        client.send_str(format!("ERR - Expected 3 or 8 parameters, got {argc}\n"));
        return;
    }

    let (name, rest) = match split_name(args) {
        Ok(v) => v,
        Err(e) => {
            client.send_str(e);
            return;
        }
    };
    let (attr, _) = rest.split_once(',').unwrap_or((rest, ""));

    if attr == "all" {
        if argc != 8 {
            client.send_str("ERR - The \"all\" attribute requires 8 parameters.\n");
            return;
        }
        let fields: Vec<&str> = rest.split(',').skip(1).collect();
        let coords = match parse_coords(&fields) {
            Ok(c) => c,
            Err(n) => {
                client.send_str(format!(
                    "ERR - Error parsing value arguments (successfully parsed {n} of 6)\n"
                ));
                return;
            }
        };
        match inner.ctx.catalog.set_box(
            name,
            [coords[0], coords[1], coords[2], coords[3], coords[4], coords[5]],
        ) {
            Ok(()) => client.send_str(format!("OK - Zone \"{name}\" was updated.\n")),
            Err(e) => client.send_str(format!("ERR - {e}\n")),
        }
    } else {
        if argc != 3 {
            client.send_str("ERR - Only the \"all\" attribute accepts 8 parameters.  Use 3.\n");
            return;
        }
        // The value is everything after the last comma.
        let value = args.rsplit(',').next().unwrap_or("");
        match inner.ctx.catalog.set_attr(name, attr, value) {
            Ok(()) => client.send_str(format!(
                "OK - Zone \"{name}\" attribute \"{attr}\" was updated.\n"
            )),
            Err(e) => client.send_str(format!("ERR - {e}\n")),
        }
    }
}

fn rmzone(inner: &Arc<ServerInner>, client: &Arc<Client>, args: &str) {
    if !inner.ctx.catalog.contains(args) {
        client.send_str(format!("ERR - Zone \"{args}\" not found.\n"));
        return;
    }
    // Notify subscribed clients about zone removal before it happens.
    broadcast_removal(inner, args);
    match inner.ctx.catalog.remove(args) {
        Ok(()) => client.send_str(format!("OK - Zone \"{args}\" was removed.\n")),
        Err(e) => client.send_str(format!("ERR - {e}\n")),
    }
}

fn broadcast_removal(inner: &Arc<ServerInner>, name: &str) {
    let line = format!("DEL - {name}\n");
    for peer in inner.registry_snapshot() {
        if peer.subs().global {
            peer.send_str(line.clone());
        }
    }
}

fn clear(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    let mut names = Vec::new();
    inner.ctx.catalog.for_each(|z| names.push(z.name.clone()));
    for name in &names {
        broadcast_removal(inner, name);
    }
    inner.ctx.catalog.clear();
    client.send_str("OK - All zones were removed.\n");
}

fn zones(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    let catalog = &inner.ctx.catalog;
    let (idx, name) = catalog.peak();
    let mut out = format!(
        "OK - {} zones - Version {}, {} occupied, peak zone is {} \"{}\"\n",
        catalog.len(),
        catalog.version(),
        catalog.occupied_count(),
        idx,
        name.as_deref().unwrap_or("[none]")
    );
    catalog.for_each(|z| out.push_str(&format_zone_info(z, true)));
    client.send_str(out);
}

fn sub(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    client.subs().global = true;
    let mut out = String::from("OK - Subscribed to global zone updates\n");
    inner.ctx.catalog.for_each(|z| {
        out.push_str("SUB - ");
        out.push_str(&format_zone_info(z, true));
    });
    client.send_str(out);
}

fn unsub(client: &Arc<Client>) {
    client.subs().global = false;
    client.send_str("OK - Unsubscribed from global zone updates\n");
}

fn getdepth(client: &Arc<Client>) {
    let mut subs = client.subs();
    if subs.depth {
        if subs.depth_limit <= 0 {
            drop(subs);
            client.send_str("ERR - Already subscribed to depth data\n");
        } else {
            subs.depth_limit += 1;
            let limit = subs.depth_limit;
            drop(subs);
            client.send_str(format!(
                "OK - Incremented depth subscription count to {limit}\n"
            ));
        }
    } else {
        subs.depth_limit = 1;
        subs.depth = true;
        drop(subs);
        client.send_str("OK - Requested a single depth frame for delivery as a DEPTH message\n");
    }
}

fn subdepth(client: &Arc<Client>, argc: usize, args: &str) {
    if argc > 1 {
        client.send_str("ERR - Too many arguments (expected 0 or 1)\n");
        return;
    }
    let count = if argc == 1 { parse_value(args).max(-1) } else { -1 };

    {
        let mut subs = client.subs();
        subs.depth_limit = count;
        subs.depth = true;
    }

    if count > 0 {
        client.send_str(format!(
            "OK - {count} depth frame(s) will be delivered as DEPTH messages\n"
        ));
    } else {
        client.send_str(
            "OK - depth frames will be delivered as DEPTH messages until unsubscribed\n",
        );
    }
}

fn unsubdepth(client: &Arc<Client>) {
    let mut subs = client.subs();
    if !subs.depth {
        drop(subs);
        client.send_str("ERR - Not subscribed to depth data\n");
    } else {
        subs.depth = false;
        subs.depth_limit = -1;
        drop(subs);
        client.send_str("OK - Unsubscribed from depth data\n");
    }
}

fn getvideo(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    client.subs().video = true;
    inner.ctx.pipeline.request_video();
    client.send_str("OK - Requested delivery of a video frame\n");
}

fn getbright(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    client.subs().bright = true;
    inner.ctx.pipeline.request_video();
    client.send_str("OK - Requested brightness for each zone\n");
}

fn tilt(inner: &Arc<ServerInner>, client: &Arc<Client>, argc: usize, args: &str) {
    if argc > 1 {
        client.send_str("ERR - Too many arguments (expected 0 or 1)\n");
        return;
    }

    if argc == 1 {
        let tilt = parse_value(args).clamp(TILT_MIN, TILT_MAX);
        inner.ctx.pipeline.set_tilt(tilt);
        client.send_str(format!("OK - Requested tilt of {tilt} degrees\n"));
    } else {
        client.send_str(format!(
            "OK - Current tilt is {} degrees\n",
            inner.ctx.pipeline.tilt()
        ));
    }
}

fn fps(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    client.send_str(format!("OK - {} fps\n", inner.ctx.fps.fps()));
}

fn lut_cmd(client: &Arc<Client>, argc: usize, args: &str) {
    if argc > 1 {
        client.send_str("ERR - Too many arguments (expected 0 or 1)\n");
        return;
    }

    if argc == 1 {
        let d = parse_value(args);
        if !(0..lut::LUT_SIZE as i32).contains(&d) {
            client.send_str(format!(
                "ERR - Raw distance value {d} is out of range (0-2047).\n"
            ));
            return;
        }
        client.send_str(format!("OK - {d} -> {}mm.\n", lut::depth_mm(d as usize)));
    } else {
        let mut out = String::from("OK - 2048 lines follow\n");
        for i in 0..lut::LUT_SIZE {
            out.push_str(&lut::depth_mm(i).to_string());
            out.push('\n');
        }
        client.send_str(out);
    }
}

fn sa_cmd(client: &Arc<Client>, argc: usize, args: &str) {
    if argc > 1 {
        client.send_str("ERR - Too many arguments (expected 0 or 1)\n");
        return;
    }

    if argc == 1 {
        let d = parse_value(args);
        if !(0..lut::LUT_SIZE as i32).contains(&d) {
            client.send_str(format!(
                "ERR - Raw distance value {d} is out of range (0-2047).\n"
            ));
            return;
        }
        client.send_str(format!(
            "OK - {d} -> {}mm -> {:.6}mm^2.\n",
            lut::depth_mm(d as usize),
            lut::surface_at(d as usize)
        ));
    } else {
        let mut out = String::from("OK - 2048 lines follow\n");
        for i in 0..lut::LUT_SIZE {
            out.push_str(&format!("{:.6e}\n", lut::surface_at(i)));
        }
        client.send_str(out);
    }
}
