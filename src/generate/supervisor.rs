// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! `config/supervisor.conf` generator.
//!
//! One program section per process, grouped into `{name}-web`,
//! `{name}-workers`, and `{name}-redis` so `supervisorctl restart {name}:`
//! bounces the whole instance. Generating this file flips the instance into
//! supervisor mode: `restart_supervisor_on_update` goes on and the systemd
//! flag goes off.

use super::{confirm_overwrite, write_file, RenderContext, Result};
use crate::{config, lobe::Lobe};

use std::fmt::Write as _;
use tracing::info;

/// Render the whole supervisor configuration.
pub fn render(ctx: &RenderContext) -> String {
    let lobe_dir = ctx.lobe_dir.display();
    let name = &ctx.lobe_name;
    let mut out = format!(
        "; generated for the {name} instance, do not edit by hand\n\
         ; priority=1 starts first and shuts down last\n\n"
    );

    let _ = write!(
        out,
        "[program:{name}-logica-web]\n\
         command={lobe_dir}/env/bin/gunicorn -b 127.0.0.1:{port} -w {workers} \
         --max-requests {max_requests} --max-requests-jitter {jitter} \
         -t {timeout} logica.app:application --preload\n\
         priority=4\n\
         autostart=true\n\
         autorestart=true\n\
         stdout_logfile={lobe_dir}/logs/web.log\n\
         stderr_logfile={lobe_dir}/logs/web.error.log\n\
         user={user}\n\
         directory={sites_dir}\n\n",
        port = ctx.webserver_port,
        workers = ctx.gunicorn_workers,
        max_requests = ctx.gunicorn_max_requests,
        jitter = ctx.gunicorn_max_requests_jitter,
        timeout = ctx.http_timeout,
        user = ctx.user,
        sites_dir = ctx.sites_dir.display(),
    );

    let _ = write!(
        out,
        "[program:{name}-logica-schedule]\n\
         command={cmd} schedule\n\
         priority=3\n\
         autostart=true\n\
         autorestart=true\n\
         stdout_logfile={lobe_dir}/logs/schedule.log\n\
         stderr_logfile={lobe_dir}/logs/schedule.error.log\n\
         user={user}\n\
         directory={lobe_dir}\n\n",
        cmd = ctx.lobe_cmd,
        user = ctx.user,
    );

    for (queue, stopwait) in [("default", 1560), ("short", 360), ("long", 1560)] {
        let _ = write!(
            out,
            "[program:{name}-logica-{queue}-worker]\n\
             command={cmd} worker --queue {queue}\n\
             priority=4\n\
             autostart=true\n\
             autorestart=true\n\
             stdout_logfile={lobe_dir}/logs/worker.log\n\
             stderr_logfile={lobe_dir}/logs/worker.error.log\n\
             user={user}\n\
             stopwaitsecs={stopwait}\n\
             directory={lobe_dir}\n\
             killasgroup=true\n\
             numprocs={numprocs}\n\
             process_name=%(program_name)s-%(process_num)d\n\n",
            cmd = ctx.lobe_cmd,
            user = ctx.user,
            numprocs = ctx.background_workers,
        );
    }

    let _ = write!(
        out,
        "[program:{name}-node-socketio]\n\
         command={node} {lobe_dir}/apps/logica/socketio.js\n\
         priority=4\n\
         autostart=true\n\
         autorestart=true\n\
         stdout_logfile={lobe_dir}/logs/node-socketio.log\n\
         stderr_logfile={lobe_dir}/logs/node-socketio.error.log\n\
         user={user}\n\
         directory={lobe_dir}\n\n",
        node = ctx.node,
        user = ctx.user,
    );

    if !ctx.skip_redis {
        for kind in ["cache", "queue", "socketio"] {
            let _ = write!(
                out,
                "[program:{name}-redis-{kind}]\n\
                 command={redis} {lobe_dir}/config/redis_{kind}.conf\n\
                 priority=1\n\
                 autostart=true\n\
                 autorestart=true\n\
                 stdout_logfile={lobe_dir}/logs/redis-{kind}.log\n\
                 stderr_logfile={lobe_dir}/logs/redis-{kind}.error.log\n\
                 user={user}\n\
                 directory={sites_dir}\n\n",
                redis = ctx.redis_server,
                user = ctx.user,
                sites_dir = ctx.sites_dir.display(),
            );
        }
    }

    let _ = write!(
        out,
        "[group:{name}-web]\n\
         programs={name}-logica-web,{name}-node-socketio\n\n\
         [group:{name}-workers]\n\
         programs={name}-logica-schedule,{name}-logica-default-worker,\
         {name}-logica-short-worker,{name}-logica-long-worker\n"
    );

    if !ctx.skip_redis {
        let _ = write!(
            out,
            "\n[group:{name}-redis]\n\
             programs={name}-redis-cache,{name}-redis-queue,{name}-redis-socketio\n"
        );
    }

    out
}

/// Render and write `config/supervisor.conf`, then flip the restart flags.
pub fn setup(lobe: &Lobe, user: Option<String>, yes: bool, skip_redis: bool) -> Result<()> {
    let ctx = RenderContext::new(lobe, user, skip_redis)?;
    let path = lobe.path().join("config").join("supervisor.conf");

    if !confirm_overwrite(&path, yes)? {
        return Ok(());
    }

    write_file(&path, &render(&ctx))?;

    let mut flags = config::Config::new();
    flags.insert("restart_supervisor_on_update".to_string(), true.into());
    flags.insert("restart_systemd_on_update".to_string(), false.into());
    config::update_config(flags, lobe.path())?;

    info!("wrote {:?}", path.display());
    Ok(())
}
