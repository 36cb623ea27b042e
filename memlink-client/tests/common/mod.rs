//! In-process memcached stand-ins for integration tests.
//!
//! `FakeServer` speaks the text-protocol subset the client uses and keeps
//! its data in a shared map so tests can inspect server-side state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

/// Routes client logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "memlink_client=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Default)]
struct State {
    items: Mutex<HashMap<String, Entry>>,
    next_cas: AtomicU64,
    connections: AtomicUsize,
}

/// Fake memcached listening on a random local port (or a Unix socket).
pub struct FakeServer {
    addr: String,
    state: Arc<State>,
}

impl FakeServer {
    /// Starts a TCP server on `127.0.0.1:0`.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = stream.set_nodelay(true);
                spawn_session(stream, accept_state.clone());
            }
        });

        FakeServer { addr, state }
    }

    /// Starts a server on a fresh Unix-domain socket under the temp dir.
    #[cfg(unix)]
    pub fn start_unix() -> Self {
        use std::os::unix::net::UnixListener;

        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "memlink-test-{}-{}.sock",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind unix");
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                spawn_session(stream, accept_state.clone());
            }
        });

        FakeServer {
            addr: path.to_string_lossy().into_owned(),
            state,
        }
    }

    /// Address to hand to the client.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.state.items.lock().expect("items").len()
    }

    /// Returns true when `key` is stored on this server.
    pub fn contains(&self, key: &str) -> bool {
        self.state.items.lock().expect("items").contains_key(key)
    }
}

trait Duplex: Read + Write + Send + 'static {
    fn split(&self) -> io::Result<Self>
    where
        Self: Sized;
}

impl Duplex for TcpStream {
    fn split(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn split(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

fn spawn_session<S: Duplex>(stream: S, state: Arc<State>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    thread::spawn(move || {
        let Ok(reader) = stream.split() else { return };
        let _ = serve(BufReader::new(reader), stream, &state);
    });
}

fn serve<R: BufRead, W: Write>(mut reader: R, mut out: W, state: &State) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches("\r\n");
        let tokens: Vec<&str> = trimmed.split(' ').collect();
        let noreply = tokens.last() == Some(&"noreply");

        let reply = match tokens[0] {
            "get" | "gets" => {
                let items = state.items.lock().expect("items");
                let mut reply = Vec::new();
                for key in &tokens[1..] {
                    if let Some(entry) = items.get(*key) {
                        let header = if tokens[0] == "gets" {
                            format!("VALUE {} {} {} {}\r\n", key, entry.flags, entry.value.len(), entry.cas)
                        } else {
                            format!("VALUE {} {} {}\r\n", key, entry.flags, entry.value.len())
                        };
                        reply.extend_from_slice(header.as_bytes());
                        reply.extend_from_slice(&entry.value);
                        reply.extend_from_slice(b"\r\n");
                    }
                }
                reply.extend_from_slice(b"END\r\n");
                reply
            }
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let len: usize = tokens[4].parse().expect("bytes");
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data)?;
                data.truncate(len);
                store(state, &tokens, data).as_bytes().to_vec()
            }
            "delete" => {
                let removed = state.items.lock().expect("items").remove(tokens[1]);
                if removed.is_some() { b"DELETED\r\n".to_vec() } else { b"NOT_FOUND\r\n".to_vec() }
            }
            "incr" | "decr" => arith(state, tokens[0], tokens[1], tokens[2]).into_bytes(),
            "touch" => {
                if state.items.lock().expect("items").contains_key(tokens[1]) {
                    b"TOUCHED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            "flush_all" => {
                state.items.lock().expect("items").clear();
                b"OK\r\n".to_vec()
            }
            "version" => b"VERSION 1.6.0-fake\r\n".to_vec(),
            _ => b"ERROR\r\n".to_vec(),
        };

        if !noreply {
            out.write_all(&reply)?;
            out.flush()?;
        }
    }
}

fn store(state: &State, tokens: &[&str], data: Vec<u8>) -> &'static str {
    let verb = tokens[0];
    let key = tokens[1].to_owned();
    let flags: u32 = tokens[2].parse().expect("flags");
    let mut items = state.items.lock().expect("items");
    let cas = state.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
    let existing = items.get(&key).cloned();

    let value = match (verb, existing) {
        ("add", Some(_)) => return "NOT_STORED\r\n",
        ("replace" | "append" | "prepend", None) => return "NOT_STORED\r\n",
        ("cas", None) => return "NOT_FOUND\r\n",
        ("cas", Some(entry)) => {
            let token: u64 = tokens[5].parse().expect("cas token");
            if token != entry.cas {
                return "EXISTS\r\n";
            }
            Entry { value: data, flags, cas }
        }
        ("append", Some(entry)) => {
            let mut value = entry.value;
            value.extend_from_slice(&data);
            Entry { value, flags: entry.flags, cas }
        }
        ("prepend", Some(entry)) => {
            let mut value = data;
            value.extend_from_slice(&entry.value);
            Entry { value, flags: entry.flags, cas }
        }
        _ => Entry { value: data, flags, cas },
    };
    items.insert(key, value);
    "STORED\r\n"
}

fn arith(state: &State, verb: &str, key: &str, delta: &str) -> String {
    let delta: u64 = delta.parse().expect("delta");
    let mut items = state.items.lock().expect("items");
    let Some(entry) = items.get_mut(key) else {
        return "NOT_FOUND\r\n".to_owned();
    };
    let Ok(current) = std::str::from_utf8(&entry.value).unwrap_or("").trim().parse::<u64>() else {
        return "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_owned();
    };
    let next = if verb == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    entry.value = next.to_string().into_bytes();
    format!("{next}\r\n")
}

/// Starts a TCP server that answers each received command line with the
/// handler's bytes. Storage payloads are consumed and passed along.
pub fn spawn_scripted(
    handler: fn(usize, &str, &[u8]) -> Vec<u8>,
) -> (String, Arc<AtomicUsize>) {
    spawn_paced(handler, None)
}

/// Like `spawn_scripted`, but writes replies one byte per `pace` tick.
pub fn spawn_paced(
    handler: fn(usize, &str, &[u8]) -> Vec<u8>,
    pace: Option<Duration>,
) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    thread::spawn(move || {
        let mut idx = 0;
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_nodelay(true);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let Ok(clone) = stream.try_clone() else { break };
            let mut reader = BufReader::new(clone);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let command = line.trim_end_matches("\r\n").to_owned();
                let tokens: Vec<&str> = command.split(' ').collect();
                let mut payload = Vec::new();
                if matches!(tokens[0], "set" | "add" | "replace" | "cas") {
                    let len: usize = tokens[4].parse().expect("bytes");
                    payload = vec![0u8; len + 2];
                    if reader.read_exact(&mut payload).is_err() {
                        break;
                    }
                }
                let reply = handler(idx, &command, &payload);
                idx += 1;
                if write_reply(&mut stream, &reply, pace).is_err() {
                    break;
                }
            }
        }
    });

    (addr, accepted)
}

fn write_reply(stream: &mut TcpStream, reply: &[u8], pace: Option<Duration>) -> io::Result<()> {
    let Some(pace) = pace else {
        return stream.write_all(reply);
    };
    for byte in reply {
        stream.write_all(std::slice::from_ref(byte))?;
        thread::sleep(pace);
    }
    Ok(())
}
