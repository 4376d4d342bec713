// Copyright 2018-2025 the Deno authors. MIT license.

use anyhow::Context;
use anyhow::Error;
use clap::ArgMatches;
use clap::builder::Arg;
use clap::builder::Command;
use std::net::SocketAddr;
use uv_stream::EventName;
use uv_stream::HandleId;
use uv_stream::HandleKind;
use uv_stream::LoopOptions;
use uv_stream::StreamEvent;
use uv_stream::StreamLoop;
use uv_stream::TcpSubstrate;

fn main() -> Result<(), Error> {
  eprintln!("🛑 uvecho is meant for development and testing purposes.");

  let cli = build_cli();
  let mut matches = cli.get_matches();

  let addr = matches
    .remove_one::<SocketAddr>("addr")
    .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 7000)));
  let options = loop_options(&mut matches)?;

  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;

  runtime.block_on(async move {
    let lp = StreamLoop::new(TcpSubstrate::new(), options);
    let server = lp.new_handle(HandleKind::Tcp);
    lp.bind(server, addr)?;
    lp.listen(server, None, on_connection)?;
    println!("Listening on {}", lp.local_addr(server)?);
    lp.run_event_loop().await?;
    Ok::<_, Error>(())
  })
}

fn build_cli() -> Command {
  Command::new("uvecho")
    .arg(
      Arg::new("addr")
        .long("addr")
        .value_name("HOST_AND_PORT")
        .help("Address to listen on (default: 127.0.0.1:7000)")
        .value_parser(clap::value_parser!(SocketAddr)),
    )
    .arg(
      Arg::new("backlog")
        .long("backlog")
        .value_name("N")
        .help("Listen backlog (default: 128)")
        .value_parser(clap::value_parser!(u32)),
    )
    .arg(
      Arg::new("config")
        .long("config")
        .value_name("FILE")
        .help("JSON file with loop options, e.g. {\"readBufferSize\": 4096}")
        .value_hint(clap::ValueHint::FilePath)
        .value_parser(clap::value_parser!(String)),
    )
}

fn loop_options(matches: &mut ArgMatches) -> Result<LoopOptions, Error> {
  let mut options = match matches.remove_one::<String>("config") {
    Some(path) => {
      let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Unable to read {path}"))?;
      LoopOptions::from_json(&json)
        .with_context(|| format!("Invalid loop options in {path}"))?
    }
    None => LoopOptions::default(),
  };
  if let Some(backlog) = matches.remove_one::<u32>("backlog") {
    options.default_backlog = backlog;
  }
  Ok(options)
}

fn on_connection(lp: &StreamLoop, server: HandleId) -> Result<(), Error> {
  let client = lp.new_handle(HandleKind::Tcp);
  lp.accept(server, client)?;
  log::debug!("accepted connection {client}");

  lp.on(client, EventName::Data, move |lp, event| {
    if let StreamEvent::Data { view, .. } = event {
      lp.write(client, view.to_bytes(), move |lp, result| {
        if let Err(err) = result {
          eprintln!("connection {client}: {err}");
          let _ = lp.close(client, |_, _| {});
        }
      })?;
    }
    Ok(())
  })?;
  lp.on(client, EventName::End, move |lp, _| {
    lp.shutdown(client, move |lp, _| {
      let _ = lp.close(client, |_, _| {});
    })?;
    Ok(())
  })?;
  lp.on(client, EventName::Error, move |lp, event| {
    if let StreamEvent::Error(err) = event {
      eprintln!("connection {client}: {err}");
    }
    lp.close(client, |_, _| {})?;
    Ok(())
  })?;
  lp.read_start(client)?;
  Ok(())
}
