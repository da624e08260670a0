// core/src/remote.rs
//
// Language model served over a line-based socket protocol.
//
// After the version handshake (`_R_E_M_O_T_E_L_M_V=2` answered by `OK`)
// every request is one line and gets one reply line:
//
//   W h1 .. hn word      -> OK logp
//   C1 h1 .. hn          -> OK id length
//   C2 h1 .. hn word     -> OK id length
//   B h1 .. hn length    -> OK bow
//
// History words are sent oldest first. Failures are answered with a line
// starting with `ERROR`.

use std::cell::{Cell, RefCell};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::{LmError, Result};
use crate::lm::{ContextId, LanguageModel};
use crate::prob::{parse_logp, LogP, LOGP_ONE, LOGP_ZERO};
use crate::vocab::{Vocab, VocabIndex};

pub const PROTOCOL_HANDSHAKE: &str = "_R_E_M_O_T_E_L_M_V=2";

struct Connection {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
}

impl Connection {
    fn request(&mut self, line: &str) -> Result<String> {
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            return Err(LmError::Protocol("server closed the connection".to_string()));
        }
        let reply = reply.trim_end();
        match reply.strip_prefix("OK") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => Ok(rest.trim().to_string()),
            _ => Err(LmError::Protocol(format!("request '{}' failed: {}", line, reply))),
        }
    }
}

/// Client side. Probabilities are cached per (word, context truncated to
/// `cache_order - 1` words); the server's answers are assumed stable for
/// the life of the connection. A failed query is reported as zero
/// probability and the error is kept for [`RemoteLm::take_error`].
pub struct RemoteLm {
    vocab: Vocab,
    cache_order: usize,
    connection: RefCell<Connection>,
    cache: RefCell<LruCache<(VocabIndex, Vec<VocabIndex>), LogP>>,
    cache_hits: Cell<usize>,
    error: RefCell<Option<LmError>>,
}

impl RemoteLm {
    /// Connect to `addr` and negotiate the protocol version.
    pub fn connect<A: ToSocketAddrs>(addr: A, vocab: Vocab, cache_order: usize, cache_capacity: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Self::from_streams(vocab, Box::new(reader), Box::new(stream), cache_order, cache_capacity)
    }

    /// Run the handshake over an already established transport.
    pub fn from_streams(
        vocab: Vocab,
        reader: Box<dyn BufRead + Send>,
        writer: Box<dyn Write + Send>,
        cache_order: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let mut connection = Connection { reader, writer };
        connection
            .request(PROTOCOL_HANDSHAKE)
            .map_err(|e| LmError::Protocol(format!("handshake failed: {}", e)))?;
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        tracing::info!(cache_order, cache_capacity, "connected to remote model");
        Ok(Self {
            vocab,
            cache_order,
            connection: RefCell::new(connection),
            cache: RefCell::new(LruCache::new(capacity)),
            cache_hits: Cell::new(0),
            error: RefCell::new(None),
        })
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.get()
    }

    /// First error hit since the last call, if any.
    pub fn take_error(&self) -> Option<LmError> {
        self.error.borrow_mut().take()
    }

    fn record(&self, err: LmError) {
        tracing::error!(error = %err, "remote model query failed");
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn truncate<'c>(&self, context: &'c [VocabIndex]) -> &'c [VocabIndex] {
        match self.cache_order {
            0 => context,
            n => &context[..context.len().min(n - 1)],
        }
    }

    fn history(&self, command: &str, context: &[VocabIndex]) -> String {
        let mut line = command.to_string();
        for &w in context.iter().rev() {
            line.push(' ');
            line.push_str(&self.vocab.display_word(w));
        }
        line
    }

    pub fn try_word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> Result<LogP> {
        let context = self.truncate(context);
        let key = (word, context.to_vec());
        if self.cache_order > 0 {
            if let Some(&p) = self.cache.borrow_mut().get(&key) {
                self.cache_hits.set(self.cache_hits.get() + 1);
                return Ok(p);
            }
        }
        let mut line = self.history("W", context);
        line.push(' ');
        line.push_str(&self.vocab.display_word(word));
        let reply = self.connection.borrow_mut().request(&line)?;
        let p = parse_logp(&reply).ok_or_else(|| LmError::Protocol(format!("bad probability '{}'", reply)))?;
        if self.cache_order > 0 {
            self.cache.borrow_mut().put(key, p);
        }
        Ok(p)
    }

    pub fn try_context_id(&self, word: Option<VocabIndex>, context: &[VocabIndex]) -> Result<ContextId> {
        let context = self.truncate(context);
        let line = match word {
            Some(w) => format!("{} {}", self.history("C2", context), self.vocab.display_word(w)),
            None => self.history("C1", context),
        };
        let reply = self.connection.borrow_mut().request(&line)?;
        let mut fields = reply.split_whitespace();
        let id = fields.next().and_then(|f| f.parse::<u64>().ok());
        let length = fields.next().and_then(|f| f.parse::<usize>().ok());
        match (id, length) {
            (Some(id), Some(length)) => Ok(ContextId { id, length }),
            _ => Err(LmError::Protocol(format!("bad context id '{}'", reply))),
        }
    }

    pub fn try_context_bow(&self, context: &[VocabIndex], length: usize) -> Result<LogP> {
        let context = self.truncate(context);
        let line = format!("{} {}", self.history("B", context), length);
        let reply = self.connection.borrow_mut().request(&line)?;
        parse_logp(&reply).ok_or_else(|| LmError::Protocol(format!("bad backoff weight '{}'", reply)))
    }
}

impl LanguageModel for RemoteLm {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        self.try_word_prob(word, context).unwrap_or_else(|e| {
            self.record(e);
            LOGP_ZERO
        })
    }

    fn order(&self) -> usize {
        self.cache_order
    }

    fn context_id(&self, word: Option<VocabIndex>, context: &[VocabIndex]) -> ContextId {
        self.try_context_id(word, context).unwrap_or_else(|e| {
            self.record(e);
            ContextId::of_words(context)
        })
    }

    fn context_bow(&self, context: &[VocabIndex], length: usize) -> LogP {
        self.try_context_bow(context, length).unwrap_or_else(|e| {
            self.record(e);
            LOGP_ONE
        })
    }
}

fn format_logp(p: LogP) -> String {
    if p == LOGP_ZERO {
        "-inf".to_string()
    } else {
        format!("{}", p)
    }
}

/// Answer one request line.
fn answer(lm: &dyn LanguageModel, line: &str) -> std::result::Result<String, String> {
    let vocab = lm.vocab();
    let fields: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = fields.split_first() else {
        return Err("empty request".to_string());
    };
    let context_of = |words: &[&str]| -> Vec<VocabIndex> { words.iter().rev().map(|w| vocab.index_or_unk(w)).collect() };

    match command {
        PROTOCOL_HANDSHAKE => Ok("OK".to_string()),
        "W" => {
            let (word, history) = args.split_last().ok_or("W needs a word")?;
            let p = lm.word_prob(vocab.index_or_unk(word), &context_of(history));
            Ok(format!("OK {}", format_logp(p)))
        }
        "C1" => {
            let id = lm.context_id(None, &context_of(args));
            Ok(format!("OK {} {}", id.id, id.length))
        }
        "C2" => {
            let (word, history) = args.split_last().ok_or("C2 needs a word")?;
            let id = lm.context_id(Some(vocab.index_or_unk(word)), &context_of(history));
            Ok(format!("OK {} {}", id.id, id.length))
        }
        "B" => {
            let (length, history) = args.split_last().ok_or("B needs a length")?;
            let length: usize = length.parse().map_err(|_| format!("bad length '{}'", length))?;
            Ok(format!("OK {}", format_logp(lm.context_bow(&context_of(history), length))))
        }
        other => Err(format!("unknown command '{}'", other)),
    }
}

/// Serve requests from `reader` until end of input, writing replies to
/// `writer`. Returns the number of requests answered.
pub fn serve_connection<R: BufRead, W: Write>(lm: &dyn LanguageModel, mut reader: R, mut writer: W) -> Result<usize> {
    let mut served = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match answer(lm, &line) {
            Ok(reply) => writeln!(writer, "{}", reply)?,
            Err(message) => {
                tracing::warn!(request = line.trim(), message = %message, "bad request");
                writeln!(writer, "ERROR {}", message)?;
            }
        }
        writer.flush()?;
        served += 1;
    }
    Ok(served)
}

/// Accept clients one at a time. Stops after `max_clients` connections
/// when given.
pub fn serve(lm: &dyn LanguageModel, listener: &TcpListener, max_clients: Option<usize>) -> Result<()> {
    let mut clients = 0;
    for stream in listener.incoming() {
        let stream = stream?;
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        tracing::info!(peer = %peer, "client connected");
        let reader = BufReader::new(stream.try_clone()?);
        match serve_connection(lm, reader, stream) {
            Ok(served) => tracing::info!(peer = %peer, served, "client disconnected"),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "client connection failed"),
        }
        clients += 1;
        if max_clients.is_some_and(|max| clients >= max) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::NullLm;

    #[test]
    fn server_answers_protocol_lines() {
        let vocab = Vocab::new();
        vocab.add_words(&["a", "b"]);
        let lm = NullLm::new(vocab);
        let input = format!("{}\nW a b\nC1 a\nB a 0\nX\n", PROTOCOL_HANDSHAKE);
        let mut out = Vec::new();
        let served = serve_connection(&lm, input.as_bytes(), &mut out).unwrap();
        assert_eq!(served, 5);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "OK");
        assert_eq!(lines[1], "OK 0");
        assert_eq!(lines[2], "OK 0 0");
        assert_eq!(lines[3], "OK 0");
        assert!(lines[4].starts_with("ERROR"));
    }

    #[test]
    fn client_rejects_failed_handshake() {
        let reply: &'static [u8] = b"ERROR nope\n";
        let result = RemoteLm::from_streams(Vocab::new(), Box::new(reply), Box::new(Vec::new()), 3, 10);
        assert!(matches!(result, Err(LmError::Protocol(_))));
    }

    #[test]
    fn client_records_malformed_replies() {
        let replies: &'static [u8] = b"OK\nOK -0.5\nOK what\n";
        let vocab = Vocab::new();
        let a = vocab.add_word("a");
        let lm = RemoteLm::from_streams(vocab, Box::new(replies), Box::new(Vec::new()), 2, 10).unwrap();
        assert_eq!(lm.word_prob(a, &[]), -0.5);
        // second query is answered from the cache
        assert_eq!(lm.word_prob(a, &[]), -0.5);
        assert_eq!(lm.cache_hits(), 1);
        assert_eq!(lm.word_prob(a, &[a]), LOGP_ZERO);
        assert!(matches!(lm.take_error(), Some(LmError::Protocol(_))));
        assert!(lm.take_error().is_none());
    }
}
