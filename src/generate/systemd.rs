// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! systemd unit generator.
//!
//! Renders the full unit tree under `config/systemd/`: one umbrella target,
//! three group targets (web, workers, redis), and the services they pull in.
//! Worker services are systemd templates (`…-worker@.service`) instantiated
//! once per configured background worker. Generating these units turns both
//! restart-on-update flags off; units are meant to be symlinked into
//! `/etc/systemd/system` and managed there.

use super::{confirm_overwrite, write_file, GenerateError, RenderContext, Result};
use crate::{config, lobe::Lobe};

use tracing::info;

/// Render every unit file as `(file name, contents)` pairs.
pub fn unit_files(ctx: &RenderContext) -> Vec<(String, String)> {
    let name = &ctx.lobe_name;
    let mut units = vec![
        (format!("{name}.target"), main_target(ctx)),
        (format!("{name}-web.target"), web_target(ctx)),
        (format!("{name}-workers.target"), workers_target(ctx)),
        (format!("{name}-redis.target"), redis_target(ctx)),
        (format!("{name}-logica-web.service"), web_service(ctx)),
        (
            format!("{name}-node-socketio.service"),
            socketio_service(ctx),
        ),
        (
            format!("{name}-logica-schedule.service"),
            schedule_service(ctx),
        ),
    ];

    for queue in ["default", "short", "long"] {
        units.push((
            format!("{name}-logica-{queue}-worker@.service"),
            worker_service(ctx, queue),
        ));
    }

    for kind in ["cache", "queue", "socketio"] {
        units.push((
            format!("{name}-redis-{kind}.service"),
            redis_service(ctx, kind),
        ));
    }

    units
}

fn main_target(ctx: &RenderContext) -> String {
    let name = &ctx.lobe_name;
    format!(
        "[Unit]\n\
         Description=Logica instance {name}\n\
         Requires={name}-web.target {name}-workers.target {name}-redis.target\n\
         After=network.target\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

fn web_target(ctx: &RenderContext) -> String {
    let name = &ctx.lobe_name;
    format!(
        "[Unit]\n\
         Description=Web processes of instance {name}\n\
         Requires={name}-logica-web.service {name}-node-socketio.service\n\
         PartOf={name}.target\n"
    )
}

fn workers_target(ctx: &RenderContext) -> String {
    let name = &ctx.lobe_name;
    let mut wants = vec![format!("{name}-logica-schedule.service")];
    for queue in ["default", "short", "long"] {
        for i in 1..=ctx.background_workers {
            wants.push(format!("{name}-logica-{queue}-worker@{i}.service"));
        }
    }

    format!(
        "[Unit]\n\
         Description=Background workers of instance {name}\n\
         Wants={}\n\
         PartOf={name}.target\n",
        wants.join(" ")
    )
}

fn redis_target(ctx: &RenderContext) -> String {
    let name = &ctx.lobe_name;
    format!(
        "[Unit]\n\
         Description=Redis servers of instance {name}\n\
         Requires={name}-redis-cache.service {name}-redis-queue.service \
         {name}-redis-socketio.service\n\
         PartOf={name}.target\n"
    )
}

fn web_service(ctx: &RenderContext) -> String {
    format!(
        "[Unit]\n\
         Description=Web server of instance {name}\n\
         PartOf={name}-web.target\n\n\
         [Service]\n\
         User={user}\n\
         Type=simple\n\
         Restart=always\n\
         WorkingDirectory={sites_dir}\n\
         ExecStart={lobe_dir}/env/bin/gunicorn -b 127.0.0.1:{port} -w {workers} \
         --max-requests {max_requests} --max-requests-jitter {jitter} \
         -t {timeout} logica.app:application --preload\n\
         StandardOutput=append:{lobe_dir}/logs/web.log\n\
         StandardError=append:{lobe_dir}/logs/web.error.log\n",
        name = ctx.lobe_name,
        user = ctx.user,
        sites_dir = ctx.sites_dir.display(),
        lobe_dir = ctx.lobe_dir.display(),
        port = ctx.webserver_port,
        workers = ctx.gunicorn_workers,
        max_requests = ctx.gunicorn_max_requests,
        jitter = ctx.gunicorn_max_requests_jitter,
        timeout = ctx.http_timeout,
    )
}

fn socketio_service(ctx: &RenderContext) -> String {
    format!(
        "[Unit]\n\
         Description=Socketio server of instance {name}\n\
         PartOf={name}-web.target\n\n\
         [Service]\n\
         User={user}\n\
         Type=simple\n\
         Restart=always\n\
         WorkingDirectory={lobe_dir}\n\
         ExecStart={node} {lobe_dir}/apps/logica/socketio.js\n\
         StandardOutput=append:{lobe_dir}/logs/node-socketio.log\n\
         StandardError=append:{lobe_dir}/logs/node-socketio.error.log\n",
        name = ctx.lobe_name,
        user = ctx.user,
        lobe_dir = ctx.lobe_dir.display(),
        node = ctx.node,
    )
}

fn schedule_service(ctx: &RenderContext) -> String {
    format!(
        "[Unit]\n\
         Description=Scheduler of instance {name}\n\
         PartOf={name}-workers.target\n\n\
         [Service]\n\
         User={user}\n\
         Type=simple\n\
         Restart=always\n\
         WorkingDirectory={lobe_dir}\n\
         ExecStart={cmd} schedule\n\
         StandardOutput=append:{lobe_dir}/logs/schedule.log\n\
         StandardError=append:{lobe_dir}/logs/schedule.error.log\n",
        name = ctx.lobe_name,
        user = ctx.user,
        lobe_dir = ctx.lobe_dir.display(),
        cmd = ctx.lobe_cmd,
    )
}

fn worker_service(ctx: &RenderContext, queue: &str) -> String {
    format!(
        "[Unit]\n\
         Description={queue} queue worker %i of instance {name}\n\
         PartOf={name}-workers.target\n\n\
         [Service]\n\
         User={user}\n\
         Type=simple\n\
         Restart=always\n\
         WorkingDirectory={lobe_dir}\n\
         ExecStart={cmd} worker --queue {queue}\n\
         StandardOutput=append:{lobe_dir}/logs/worker.log\n\
         StandardError=append:{lobe_dir}/logs/worker.error.log\n",
        name = ctx.lobe_name,
        user = ctx.user,
        lobe_dir = ctx.lobe_dir.display(),
        cmd = ctx.lobe_cmd,
    )
}

fn redis_service(ctx: &RenderContext, kind: &str) -> String {
    format!(
        "[Unit]\n\
         Description=Redis {kind} of instance {name}\n\
         PartOf={name}-redis.target\n\n\
         [Service]\n\
         User={user}\n\
         Type=simple\n\
         Restart=always\n\
         WorkingDirectory={sites_dir}\n\
         ExecStart={redis} {lobe_dir}/config/redis_{kind}.conf\n\
         StandardOutput=append:{lobe_dir}/logs/redis-{kind}.log\n\
         StandardError=append:{lobe_dir}/logs/redis-{kind}.error.log\n",
        name = ctx.lobe_name,
        user = ctx.user,
        sites_dir = ctx.sites_dir.display(),
        lobe_dir = ctx.lobe_dir.display(),
        redis = ctx.redis_server,
    )
}

/// Render and write the unit tree, then turn both restart flags off.
pub fn setup(lobe: &Lobe, user: Option<String>, yes: bool) -> Result<()> {
    let ctx = RenderContext::new(lobe, user, false)?;
    let systemd_dir = lobe.path().join("config").join("systemd");

    if !confirm_overwrite(&systemd_dir.join(format!("{}.target", ctx.lobe_name)), yes)? {
        return Ok(());
    }

    mkdirp::mkdirp(&systemd_dir).map_err(|err| GenerateError::CreateDir {
        source: err,
        path: systemd_dir.clone(),
    })?;

    for (file, contents) in unit_files(&ctx) {
        write_file(&systemd_dir.join(file), &contents)?;
    }

    let mut flags = config::Config::new();
    flags.insert("restart_supervisor_on_update".to_string(), false.into());
    flags.insert("restart_systemd_on_update".to_string(), false.into());
    config::update_config(flags, lobe.path())?;

    info!("wrote systemd units to {:?}", systemd_dir.display());
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
            background_workers: 2,
            redis_server: "/usr/bin/redis-server".to_string(),
            node: "/usr/bin/node".to_string(),
            lobe_cmd: "/usr/local/bin/lobe".to_string(),
            skip_redis: false,
        }
    }

    #[test]
    fn renders_the_full_unit_tree() {
        let units = unit_files(&fixture_ctx());
        let names: Vec<&str> = units.iter().map(|(name, _)| name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "prod.target",
                "prod-web.target",
                "prod-workers.target",
                "prod-redis.target",
                "prod-logica-web.service",
                "prod-node-socketio.service",
                "prod-logica-schedule.service",
                "prod-logica-default-worker@.service",
                "prod-logica-short-worker@.service",
                "prod-logica-long-worker@.service",
                "prod-redis-cache.service",
                "prod-redis-queue.service",
                "prod-redis-socketio.service",
            ]
        );
    }

    #[test]
    fn main_target_requires_the_group_targets() {
        let target = main_target(&fixture_ctx());

        assert!(target
            .contains("Requires=prod-web.target prod-workers.target prod-redis.target"));
        assert!(target.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn workers_target_wants_one_instance_per_background_worker() {
        let target = workers_target(&fixture_ctx());

        assert!(target.contains("prod-logica-default-worker@1.service"));
        assert!(target.contains("prod-logica-default-worker@2.service"));
        assert!(target.contains("prod-logica-long-worker@2.service"));
        assert!(!target.contains("worker@3"));
    }

    #[test]
    fn web_service_runs_gunicorn_from_the_sites_dir() {
        let service = web_service(&fixture_ctx());

        assert!(service.contains("WorkingDirectory=/home/logica/prod/sites"));
        assert!(service.contains("ExecStart=/home/logica/prod/env/bin/gunicorn"));
        assert!(service.contains("-b 127.0.0.1:8000 -w 5"));
    }
}
