//! Server-level commands.
//!
//! These touch the server rather than the keyspace, so the executor does
//! not run them:
//!
//! - `BGREWRITEAOF`
//! - `INFO [server|persistence|stats|keyspace]`
//! - `CONFIG SET appendonly|appendfsync <value>`
//! - `DEBUG HTSTATS <db>`
//! - `SHUTDOWN`

use super::Server;
use crate::aof::{AofError, AofState, WriteError};
use crate::commands::parse_i64;
use crate::config::parse_yes_no;
use crate::dict::TableStats;
use crate::protocol::RespValue;
use crate::reactor::EventLoop;
use bytes::Bytes;
use std::fmt::Write as _;
use tracing::{info, warn};

impl Server {
    pub(crate) fn admin(&mut self, el: &mut EventLoop<Server>, name: &str, args: &[Bytes]) -> RespValue {
        match name {
            "BGREWRITEAOF" => self.cmd_bgrewriteaof(el),
            "INFO" => {
                let section = args.first().map(|s| String::from_utf8_lossy(s).to_ascii_lowercase());
                RespValue::bulk_string(self.info(section.as_deref()))
            }
            "CONFIG" => self.cmd_config(el, args),
            "DEBUG" => self.cmd_debug(args),
            "SHUTDOWN" => {
                info!("SHUTDOWN requested by a client");
                el.stop();
                RespValue::ok()
            }
            _ => RespValue::error(format!("ERR unknown command '{}'", name)),
        }
    }

    fn cmd_bgrewriteaof(&mut self, el: &mut EventLoop<Server>) -> RespValue {
        match self.aof.start_background_rewrite(el, &self.keyspace) {
            Ok(_) => RespValue::simple_string("Background append only file rewriting started"),
            Err(AofError::AlreadyRunning) => {
                RespValue::error("ERR Background append only file rewriting already in progress")
            }
            Err(e) => {
                warn!(error = %e, "BGREWRITEAOF failed");
                RespValue::error(
                    "ERR Can't execute an AOF background rewriting. Please check the server logs for more information.",
                )
            }
        }
    }

    /// CONFIG SET <option> <value>
    fn cmd_config(&mut self, el: &mut EventLoop<Server>, args: &[Bytes]) -> RespValue {
        if !args[0].eq_ignore_ascii_case(b"SET") {
            return RespValue::error("ERR CONFIG subcommand must be SET");
        }
        if args.len() != 3 {
            return RespValue::wrong_arity("config set");
        }
        let option = String::from_utf8_lossy(&args[1]).to_ascii_lowercase();
        let value = String::from_utf8_lossy(&args[2]).into_owned();
        let invalid = || RespValue::error(format!("ERR Invalid argument '{}' for CONFIG SET '{}'", value, option));

        match option.as_str() {
            "appendonly" => {
                let Some(enable) = parse_yes_no(&value) else {
                    return invalid();
                };
                let result = match (enable, self.aof.state()) {
                    (true, AofState::Off) => self.aof.start_append_only(el, &self.keyspace),
                    (false, state) if state != AofState::Off => self.aof.stop_append_only(el),
                    _ => Ok(()),
                };
                match result {
                    Ok(()) => {
                        self.config.aof.enabled = enable;
                        RespValue::ok()
                    }
                    Err(e) if e.is_fatal() => {
                        self.fail(el, e);
                        RespValue::error("ERR Unable to turn on AOF. Check server logs.")
                    }
                    Err(_) => RespValue::error("ERR Unable to turn on AOF. Check server logs."),
                }
            }
            "appendfsync" => match self.config.set(&option, &value) {
                Ok(()) => {
                    self.aof.set_fsync_policy(self.config.aof.fsync);
                    RespValue::ok()
                }
                Err(_) => invalid(),
            },
            _ => RespValue::error(format!("ERR Unsupported CONFIG parameter: {}", option)),
        }
    }

    /// DEBUG HTSTATS <db>
    fn cmd_debug(&self, args: &[Bytes]) -> RespValue {
        if !args[0].eq_ignore_ascii_case(b"HTSTATS") {
            return RespValue::error("ERR DEBUG subcommand must be HTSTATS");
        }
        let Some(id) = args.get(1).and_then(|a| parse_i64(a)) else {
            return RespValue::wrong_arity("debug htstats");
        };
        let Some(db) = usize::try_from(id).ok().and_then(|id| self.keyspace.db(id)) else {
            return RespValue::error("ERR Out of range database");
        };

        let mut out = String::new();
        let _ = writeln!(out, "[Dictionary HT]");
        write_table_stats(&mut out, "main", &db.dict().stats().main);
        if let Some(target) = db.dict().stats().target {
            write_table_stats(&mut out, "rehashing target", &target);
        }
        let _ = writeln!(out, "[Expires HT]");
        write_table_stats(&mut out, "main", &db.expires().stats().main);
        if let Some(target) = db.expires().stats().target {
            write_table_stats(&mut out, "rehashing target", &target);
        }
        RespValue::bulk_string(out)
    }

    /// Renders `INFO`. `None` or `"all"` renders every section.
    pub(crate) fn info(&self, section: Option<&str>) -> String {
        let all = matches!(section, None | Some("all") | Some("default"));
        let wants = |name: &str| all || section == Some(name);
        let mut out = String::new();

        if wants("server") {
            let _ = write!(
                out,
                "# Server\r\nemberkv_version:{}\r\nprocess_id:{}\r\ntcp_port:{}\r\nuptime_in_seconds:{}\r\nhz:{}\r\nmultiplexing_api:poll\r\n\r\n",
                crate::VERSION,
                std::process::id(),
                self.config.port,
                self.started.elapsed().as_secs(),
                self.config.hz,
            );
        }

        if wants("persistence") {
            let aof = self.aof.status();
            let write_status = match aof.last_write_error {
                None => "ok".to_string(),
                Some(WriteError::Short { written, expected }) => format!("err (short write {}/{})", written, expected),
                Some(WriteError::Io(kind)) => format!("err ({})", kind),
            };
            let _ = write!(
                out,
                "# Persistence\r\nloading:{}\r\naof_enabled:{}\r\naof_rewrite_in_progress:{}\r\naof_rewrite_scheduled:{}\r\naof_last_rewrite_time_sec:{}\r\naof_last_bgrewrite_status:{}\r\naof_last_write_status:{}\r\n",
                self.keyspace.is_loading() as u8,
                (aof.state != AofState::Off) as u8,
                aof.rewrite_in_progress as u8,
                aof.rewrite_scheduled as u8,
                aof.last_rewrite_duration.map_or(-1, |d| d.as_secs() as i64),
                if aof.last_bgrewrite_ok { "ok" } else { "err" },
                write_status,
            );
            if aof.state != AofState::Off {
                let _ = write!(
                    out,
                    "aof_current_size:{}\r\naof_base_size:{}\r\naof_buffer_length:{}\r\naof_rewrite_buffer_length:{}\r\naof_pending_bio_fsync:{}\r\naof_delayed_fsync:{}\r\n",
                    aof.current_size,
                    aof.rewrite_base_size,
                    aof.buffer_length,
                    aof.rewrite_buffer_length,
                    aof.pending_bio_fsync,
                    aof.delayed_fsync,
                );
            }
            out.push_str("\r\n");
        }

        if wants("stats") {
            let ks = self.keyspace.stats();
            let _ = write!(
                out,
                "# Stats\r\ntotal_connections_received:{}\r\nconnected_clients:{}\r\ntotal_commands_processed:{}\r\nrejected_connections:{}\r\nexpired_keys:{}\r\nkeyspace_hits:{}\r\nkeyspace_misses:{}\r\n\r\n",
                self.stats.connections_received,
                self.connected_clients(),
                self.stats.commands_processed,
                self.stats.rejected_connections,
                ks.expired_keys,
                ks.keyspace_hits,
                ks.keyspace_misses,
            );
        }

        if wants("keyspace") {
            out.push_str("# Keyspace\r\n");
            for (db, keys, expires) in self.keyspace.keyspace_info() {
                let _ = write!(out, "db{}:keys={},expires={}\r\n", db, keys, expires);
            }
        }
        out
    }
}

fn write_table_stats(out: &mut String, label: &str, stats: &TableStats) {
    let _ = writeln!(out, "Hash table {} stats:", label);
    let _ = writeln!(out, " table size: {}", stats.size);
    let _ = writeln!(out, " number of elements: {}", stats.used);
    if stats.used == 0 {
        let _ = writeln!(out, "No stats available for empty dictionaries");
        return;
    }
    let _ = writeln!(out, " different slots: {}", stats.non_empty_slots);
    let _ = writeln!(out, " max chain length: {}", stats.max_chain);
    let avg = stats.used as f64 / stats.non_empty_slots.max(1) as f64;
    let _ = writeln!(out, " avg chain length (counted): {:.2}", avg);
    let _ = writeln!(out, " Chain length distribution:");
    for (len, &count) in stats.histogram.iter().enumerate().filter(|(_, &c)| c > 0) {
        let pct = count as f64 * 100.0 / stats.size.max(1) as f64;
        let _ = writeln!(out, "   {}: {} ({:.2}%)", len, count, pct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ClientContext;
    use crate::config::ServerConfig;
    use std::time::Duration;

    fn make_command(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    fn server(dir: &tempfile::TempDir) -> (Server, EventLoop<Server>) {
        let mut config = ServerConfig::default();
        config.dir = dir.path().to_path_buf();
        let el = EventLoop::new(config.setsize());
        (Server::new(config).unwrap(), el)
    }

    fn bulk_text(reply: RespValue) -> String {
        String::from_utf8(reply.as_bytes().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_info_sections() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut el) = server(&dir);
        let mut ctx = ClientContext::default();
        server.call(&mut el, &mut ctx, &make_command(&["SET", "a", "1"]));

        let text = bulk_text(server.call(&mut el, &mut ctx, &make_command(&["INFO"])));
        assert!(text.contains("# Persistence\r\n"));
        assert!(text.contains("aof_enabled:0\r\n"));
        assert!(text.contains("db0:keys=1,expires=0\r\n"));

        let text = bulk_text(server.call(&mut el, &mut ctx, &make_command(&["INFO", "keyspace"])));
        assert!(!text.contains("# Persistence"));
        assert!(text.starts_with("# Keyspace\r\n"));
    }

    #[test]
    fn test_config_set_appendfsync() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut el) = server(&dir);
        let mut ctx = ClientContext::default();

        let reply = server.call(&mut el, &mut ctx, &make_command(&["CONFIG", "SET", "appendfsync", "always"]));
        assert_eq!(reply, RespValue::ok());
        assert_eq!(server.aof.config().fsync, crate::config::FsyncPolicy::Always);

        let reply = server.call(&mut el, &mut ctx, &make_command(&["CONFIG", "SET", "appendfsync", "sometimes"]));
        assert!(reply.is_error());
        let reply = server.call(&mut el, &mut ctx, &make_command(&["CONFIG", "SET", "port", "1"]));
        assert!(reply.is_error());
        let reply = server.call(&mut el, &mut ctx, &make_command(&["CONFIG", "GET", "port"]));
        assert!(reply.is_error());
    }

    #[test]
    fn test_debug_htstats() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut el) = server(&dir);
        let mut ctx = ClientContext::default();
        for i in 0..10 {
            let key = format!("key:{}", i);
            server.call(&mut el, &mut ctx, &make_command(&["SET", &key, "v"]));
        }

        // Each table of a migrating dictionary is reported on its own.
        let migrating = server.keyspace.db(0).is_some_and(|db| db.dict().is_rehashing());
        let text = bulk_text(server.call(&mut el, &mut ctx, &make_command(&["DEBUG", "HTSTATS", "0"])));
        assert_eq!(text.contains("Hash table rehashing target stats:"), migrating);

        while server.keyspace.incremental_rehash(0, Duration::from_millis(10)) {}
        let text = bulk_text(server.call(&mut el, &mut ctx, &make_command(&["DEBUG", "HTSTATS", "0"])));
        assert!(text.contains("number of elements: 10"));
        assert!(!text.contains("rehashing target"));
        assert!(text.contains("[Expires HT]"));

        let reply = server.call(&mut el, &mut ctx, &make_command(&["DEBUG", "HTSTATS", "99"]));
        assert!(reply.is_error());
    }

    #[test]
    fn test_shutdown_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut el) = server(&dir);
        let mut ctx = ClientContext::default();

        let reply = server.call(&mut el, &mut ctx, &make_command(&["SHUTDOWN"]));
        assert_eq!(reply, RespValue::ok());
        assert!(el.is_stopped());
    }
}
