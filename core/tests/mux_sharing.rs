/*
 * mux_sharing.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Sessions sharing a multiplexed connection opened through a scripted connector.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use corriere_core::mux::{
    MuxError, MuxKind, QuicConnector, StreamEvents, StreamProvider,
};
use corriere_core::net::{AsyncStream, BoxFuture};
use corriere_core::protocol::http::RequestHead;
use corriere_core::{DownloadManager, EngineConfig, EngineInit, Session, SessionFlags};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Line codec. Client writes `REQ id target`; the peer answers with `H id status`,
/// `D id text`, `E id`, `C id code` and `G last`.
struct LineProvider {
    next_id: u32,
    buf: Vec<u8>,
    out: BytesMut,
}

impl StreamProvider for LineProvider {
    fn kind(&self) -> MuxKind {
        MuxKind::Http3
    }
    fn submit_request(&mut self, head: &RequestHead, _scheme: &str, _end: bool) -> Result<u32, MuxError> {
        let id = self.next_id;
        self.next_id += 2;
        self.out
            .extend_from_slice(format!("REQ {} {}\n", id, head.target).as_bytes());
        Ok(id)
    }
    fn submit_response(&mut self, _id: u32, _status: u16, _h: &[(String, String)], _end: bool) -> Result<(), MuxError> {
        Ok(())
    }
    fn send(&mut self, _id: u32, data: &[u8], _end: bool) -> Result<usize, MuxError> {
        Ok(data.len())
    }
    fn data_received(&mut self, input: &[u8], ev: &mut dyn StreamEvents) -> Result<(), MuxError> {
        self.buf.extend_from_slice(input);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            let parts: Vec<&str> = line.splitn(3, ' ').collect();
            let id: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            match parts[0] {
                "H" => {
                    ev.header(id, ":status", parts[2]);
                    ev.headers_complete(id, false);
                }
                "D" => ev.data(id, parts[2].as_bytes(), false),
                "E" => ev.data(id, b"", true),
                "C" => ev.stream_closed(id, parts[2].parse().unwrap()),
                "G" => ev.goaway(id, 0),
                _ => return Err(MuxError::Protocol(line.clone())),
            }
        }
        Ok(())
    }
    fn stream_reset(&mut self, _id: u32, _code: u32) {}
    fn resume_stream(&mut self, _id: u32) {}
    fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }
    fn shutdown(&mut self) {}
}

type Script = dyn Fn(usize, u32, &str) -> String + Send + Sync;

/// Each `connect` starts a peer task answering requests with `script(connection, id, target)`.
struct ScriptedConnector {
    connections: AtomicUsize,
    script: Arc<Script>,
}

impl ScriptedConnector {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(usize, u32, &str) -> String + Send + Sync + 'static,
    {
        Arc::new(Self {
            connections: AtomicUsize::new(0),
            script: Arc::new(script),
        })
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl QuicConnector for ScriptedConnector {
    fn connect<'a>(
        &'a self,
        _host: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, io::Result<(Box<dyn AsyncStream>, Box<dyn StreamProvider>)>> {
        Box::pin(async move {
            let conn = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
            let (client, peer) = duplex(64 * 1024);
            let script = self.script.clone();
            tokio::spawn(async move {
                let (rd, mut wr) = tokio::io::split(peer);
                let mut lines = BufReader::new(rd).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let parts: Vec<&str> = line.splitn(3, ' ').collect();
                    if parts.len() < 3 || parts[0] != "REQ" {
                        continue;
                    }
                    let id: u32 = parts[1].parse().unwrap();
                    let answer = script(conn, id, parts[2]);
                    if wr.write_all(answer.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
            let provider: Box<dyn StreamProvider> = Box::new(LineProvider {
                next_id: 1,
                buf: Vec::new(),
                out: BytesMut::new(),
            });
            let link: Box<dyn AsyncStream> = Box::new(client);
            Ok::<_, std::io::Error>((link, provider))
        })
    }
}

fn answer(id: u32, body: &str) -> String {
    format!("H {id} 200\nD {id} {body}\nE {id}\n")
}

fn manager(connector: Arc<ScriptedConnector>) -> DownloadManager {
    let config = EngineConfig {
        http3: true,
        disable_cache: true,
        max_retries: 3,
        ..EngineConfig::default()
    };
    let m = DownloadManager::new(config, EngineInit::global()).unwrap();
    m.set_quic_connector(Some(connector));
    m
}

async fn collect(session: &mut Session) -> Vec<u8> {
    let mut body = Vec::new();
    session.run(|d| body.extend_from_slice(d)).await.unwrap();
    body
}

#[tokio::test]
async fn sessions_share_one_connection() {
    let connector = ScriptedConnector::new(|_, id, target| answer(id, &format!("body-of-{}", target)));
    let m = manager(connector.clone());

    let mut a = m.create_session("https://media.test/a", SessionFlags::default(), None).unwrap();
    let mut b = m.create_session("https://media.test/b", SessionFlags::default(), None).unwrap();
    assert_eq!(collect(&mut a).await, b"body-of-/a");
    assert_eq!(a.transport_kind(), Some("h3"));
    assert_eq!(collect(&mut b).await, b"body-of-/b");

    assert_eq!(connector.connections(), 1);
    assert_eq!(m.multiplexer_count(), 1);
    assert_eq!(b.stats().total, Some(10));
}

#[tokio::test]
async fn last_session_leaving_closes_the_connection() {
    let connector = ScriptedConnector::new(|_, id, _| answer(id, "x"));
    let m = manager(connector.clone());

    let mut a = m.create_session("https://media.test/1", SessionFlags::default(), None).unwrap();
    let mut b = m.create_session("https://media.test/2", SessionFlags::default(), None).unwrap();
    collect(&mut a).await;
    collect(&mut b).await;
    a.close().await;
    assert_eq!(m.multiplexer_count(), 1);
    b.close().await;
    assert_eq!(m.multiplexer_count(), 0);
}

#[tokio::test]
async fn refused_stream_is_retried() {
    let refused = Arc::new(AtomicUsize::new(0));
    let r = refused.clone();
    let connector = ScriptedConnector::new(move |_, id, _| {
        if r.fetch_add(1, Ordering::SeqCst) == 0 {
            format!("C {id} 7\n")
        } else {
            answer(id, "second-try")
        }
    });
    let m = manager(connector.clone());
    let mut s = m.create_session("https://media.test/r", SessionFlags::default(), None).unwrap();
    assert_eq!(collect(&mut s).await, b"second-try");
    assert_eq!(refused.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn goaway_moves_the_session_to_a_new_connection() {
    let connector = ScriptedConnector::new(|conn, id, _| {
        if conn == 1 {
            "G 0\n".to_string()
        } else {
            answer(id, "fresh")
        }
    });
    let m = manager(connector.clone());
    let mut s = m.create_session("https://media.test/g", SessionFlags::default(), None).unwrap();
    assert_eq!(collect(&mut s).await, b"fresh");
    assert_eq!(connector.connections(), 2);
}

#[tokio::test]
async fn dropped_session_detaches_in_the_background() {
    let connector = ScriptedConnector::new(|_, id, _| answer(id, "y"));
    let m = manager(connector.clone());
    let mut s = m.create_session("https://media.test/d", SessionFlags::default(), None).unwrap();
    collect(&mut s).await;
    drop(s);
    for _ in 0..50 {
        if m.multiplexer_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(m.multiplexer_count(), 0);
    assert_eq!(m.session_count(), 0);
}
