// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! `Procfile` generator for process-manager driven development setups.

use super::{confirm_overwrite, write_file, RenderContext, Result};
use crate::lobe::Lobe;

use std::fmt::Write as _;
use tracing::info;

/// Render the development Procfile.
pub fn render(ctx: &RenderContext) -> String {
    let mut out = String::new();

    if !ctx.skip_redis {
        for kind in ["cache", "socketio", "queue"] {
            let _ = writeln!(
                out,
                "redis_{kind}: {} config/redis_{kind}.conf",
                ctx.redis_server
            );
        }
    }

    let cmd = &ctx.lobe_cmd;
    let _ = writeln!(out, "web: {cmd} serve --port {}", ctx.webserver_port);
    let _ = writeln!(out, "socketio: {} apps/logica/socketio.js", ctx.node);
    let _ = writeln!(out, "watch: {cmd} watch");
    let _ = writeln!(out, "schedule: {cmd} schedule");
    for queue in ["short", "long", "default"] {
        let _ = writeln!(
            out,
            "worker_{queue}: {cmd} worker --queue {queue} \
             1>> logs/worker.log 2>> logs/worker.error.log"
        );
    }

    out
}

/// Render and write the instance's `Procfile`.
pub fn setup(lobe: &Lobe, yes: bool, skip_redis: bool) -> Result<()> {
    let ctx = RenderContext::new(lobe, None, skip_redis)?;
    let path = lobe.path().join("Procfile");

    if !confirm_overwrite(&path, yes)? {
        return Ok(());
    }

    write_file(&path, &render(&ctx))?;
    info!("wrote {:?}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn fixture_ctx() -> RenderContext {
        RenderContext {
            lobe_dir: PathBuf::from("/home/logica/prod"),
            sites_dir: PathBuf::from("/home/logica/prod/sites"),
            lobe_name: "prod".to_string(),
            user: "logica".to_string(),
            http_timeout: 120,
            webserver_port: 8000,
            gunicorn_workers: 5,
            gunicorn_max_requests: 5000,
            gunicorn_max_requests_jitter: 500,
            background_workers: 1,
            redis_server: "redis-server".to_string(),
            node: "node".to_string(),
            lobe_cmd: "lobe".to_string(),
            skip_redis: false,
        }
    }

    #[test]
    fn renders_every_process_line() {
        let procfile = render(&fixture_ctx());

        assert_eq!(
            procfile.lines().next(),
            Some("redis_cache: redis-server config/redis_cache.conf")
        );
        assert!(procfile.contains("web: lobe serve --port 8000"));
        assert!(procfile.contains("schedule: lobe schedule"));
        assert!(procfile.contains("worker_default: lobe worker --queue default"));
        assert_eq!(procfile.lines().count(), 10);
    }

    #[test]
    fn skip_redis_drops_the_redis_lines() {
        let mut ctx = fixture_ctx();
        ctx.skip_redis = true;

        let procfile = render(&ctx);
        assert!(!procfile.contains("redis_"));
        assert_eq!(procfile.lines().count(), 7);
    }
}
