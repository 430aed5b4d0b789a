//! Calling conventions over one client connection.
//!
//! Every call goes through the same path: take a pooled command, encode the parameters
//! into it on the caller's thread, park the completion (if any) in the callback table and
//! queue the command. The conventions differ only in the completion they park:
//!
//! | Methods | Completion | Caller |
//! | --- | --- | --- |
//! | `wait_*` | [`WaitSlot`] | blocks until the response or disposal |
//! | `get`, `get_output`, `call`, `notify` | callback | returns once queued |
//! | `call_only`, `notify_only` | none | returns once queued |
//!
//! Callbacks run on the connection's receive thread, or on whichever thread disposes the
//! connection, and exactly once for every call that returned `Success`. A call that fails
//! before it was queued reports the failure through its return value and never invokes
//! its callback. A call that loses the race against `dispose` returns `Success`, because
//! its callback has already received `ClientDisposed`.
use std::{net::TcpStream, sync::Arc};

use bincode::{Decode, Encode, error::EncodeError};
use log::{debug, warn};

use crate::{
    command::{Command, CommandInfo, CommandKind, Completion, WaitSlot},
    config::ConnectionConfig,
    pool::BufferPool,
    protocol::{
        Connection, RawReturn, ReturnType, ReturnValue, Shared, TransportError, frame::NO_CALLBACK,
        payload_config,
    },
};

#[derive(Debug)]
pub struct Client {
    connection: Connection,
}

impl Client {
    /// Connects to `config.host:config.port`.
    pub fn connect(config: ConnectionConfig) -> Result<Self, TransportError> {
        let buffers = Arc::new(BufferPool::new(
            config.buffer_pool_capacity,
            config.send_buffer_size,
        ));
        Ok(Self {
            connection: Connection::connect(Arc::new(config), buffers)?,
        })
    }

    /// Runs the client side over an already connected stream.
    pub fn from_stream(
        stream: TcpStream,
        config: ConnectionConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let buffers = Arc::new(BufferPool::new(
            config.buffer_pool_capacity,
            config.send_buffer_size,
        ));
        Ok(Self {
            connection: Connection::start_client(stream, Arc::new(config), buffers)?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Blocks for the result of a call without parameters.
    pub fn wait_get<O: Decode<()>>(&self, info: &CommandInfo) -> ReturnValue<O> {
        self.wait(CommandKind::OutputOnly, info, no_input).decode()
    }

    /// Blocks for the result of a call with parameters.
    pub fn wait_get_output<I: Encode, O: Decode<()>>(
        &self,
        info: &CommandInfo,
        input: &I,
    ) -> ReturnValue<O> {
        self.wait(CommandKind::InputOutput, info, encoder(input))
            .decode()
    }

    /// Blocks until the server acknowledged a call without parameters.
    pub fn wait_call(&self, info: &CommandInfo) -> ReturnType {
        self.wait(CommandKind::Call, info, no_input).kind
    }

    /// Blocks until the server acknowledged a call with parameters.
    pub fn wait_notify<I: Encode>(&self, info: &CommandInfo, input: &I) -> ReturnType {
        self.wait(CommandKind::Call, info, encoder(input)).kind
    }

    /// Queues a call without parameters; `callback` receives its result.
    pub fn get<O, F>(&self, info: &CommandInfo, callback: F) -> ReturnType
    where
        O: Decode<()> + 'static,
        F: FnOnce(ReturnValue<O>) + Send + 'static,
    {
        let completion = Completion::Callback(Box::new(move |raw: RawReturn| {
            callback(raw.decode())
        }));
        self.submit(CommandKind::OutputOnly, info, no_input, Some(completion))
    }

    /// Queues a call with parameters; `callback` receives its result.
    pub fn get_output<I, O, F>(&self, info: &CommandInfo, input: &I, callback: F) -> ReturnType
    where
        I: Encode,
        O: Decode<()> + 'static,
        F: FnOnce(ReturnValue<O>) + Send + 'static,
    {
        let completion = Completion::Callback(Box::new(move |raw: RawReturn| {
            callback(raw.decode())
        }));
        self.submit(
            CommandKind::InputOutput,
            info,
            encoder(input),
            Some(completion),
        )
    }

    /// Queues a call without parameters; `callback` receives the acknowledgement.
    pub fn call<F>(&self, info: &CommandInfo, callback: F) -> ReturnType
    where
        F: FnOnce(ReturnType) + Send + 'static,
    {
        let completion = Completion::Callback(Box::new(move |raw: RawReturn| callback(raw.kind)));
        self.submit(CommandKind::Call, info, no_input, Some(completion))
    }

    /// Queues a call with parameters; `callback` receives the acknowledgement.
    pub fn notify<I, F>(&self, info: &CommandInfo, input: &I, callback: F) -> ReturnType
    where
        I: Encode,
        F: FnOnce(ReturnType) + Send + 'static,
    {
        let completion = Completion::Callback(Box::new(move |raw: RawReturn| callback(raw.kind)));
        self.submit(CommandKind::Call, info, encoder(input), Some(completion))
    }

    /// Queues a call without parameters and forgets about it.
    pub fn call_only(&self, info: &CommandInfo) -> ReturnType {
        self.submit(CommandKind::CallOnly, info, no_input, None)
    }

    /// Queues a call with parameters and forgets about it.
    pub fn notify_only<I: Encode>(&self, info: &CommandInfo, input: &I) -> ReturnType {
        self.submit(CommandKind::InputOnly, info, encoder(input), None)
    }

    /// Tears the connection down; outstanding calls resolve with `ClientDisposed`.
    pub fn dispose(&self) {
        self.connection.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.connection.is_disposed()
    }

    /// Disposes the connection and waits for its threads to exit.
    pub fn close(self) {
        self.connection.close();
    }

    fn wait<E>(&self, kind: CommandKind, info: &CommandInfo, encode: E) -> RawReturn
    where
        E: FnOnce(&mut Vec<u8>) -> Result<(), EncodeError>,
    {
        let shared = self.connection.shared();
        let slot = shared
            .waiters
            .pop()
            .unwrap_or_else(|| Arc::new(WaitSlot::new()));

        let status = self.submit(kind, info, encode, Some(Completion::Wait(Arc::clone(&slot))));
        let raw = match status {
            ReturnType::Success => slot.wait(),
            status => status.into(),
        };

        // Only recycle the slot once no completion path can still reach it.
        if Arc::strong_count(&slot) == 1 {
            shared.waiters.push(slot);
        }
        raw
    }

    fn submit<E>(
        &self,
        kind: CommandKind,
        info: &CommandInfo,
        encode: E,
        completion: Option<Completion>,
    ) -> ReturnType
    where
        E: FnOnce(&mut Vec<u8>) -> Result<(), EncodeError>,
    {
        let shared = self.connection.shared();
        if shared.is_disposed() {
            return ReturnType::ClientDisposed;
        }

        let mut command = match shared.commands.acquire() {
            Ok(command) => command,
            Err(e) => {
                debug!("cannot issue call {}: {e}", info.code());
                return ReturnType::ClientException;
            }
        };
        if let Err(e) = encode(command.payload_mut()) {
            warn!("failed to encode parameters of call {}: {e}", info.code());
            shared.commands.release(command);
            return ReturnType::ClientException;
        }

        let waiting = completion.as_ref().is_some_and(Completion::is_wait);
        let index = match completion.map(|completion| shared.pending.register(completion)) {
            Some(Ok(index)) => index,
            Some(Err(_)) => {
                shared.commands.release(command);
                return if shared.is_disposed() {
                    ReturnType::ClientDisposed
                } else {
                    ReturnType::ClientException
                };
            }
            None => NO_CALLBACK,
        };

        command.set_request(kind, *info, index, waiting);
        enqueue(shared, command, index)
    }
}

/// Queues a command whose completion (if any) is already registered under `index`.
fn enqueue(shared: &Shared, command: Box<Command>, index: u32) -> ReturnType {
    let Err(command) = shared.queue.push(command) else {
        return ReturnType::Success;
    };
    shared.commands.release(command);
    if index == NO_CALLBACK {
        return ReturnType::ClientDisposed;
    }
    match shared.pending.take(index) {
        // Taken back unresolved; the caller learns the outcome from the return.
        Some(_) => ReturnType::ClientDisposed,
        // `dispose` got there first and has resolved the completion already.
        None => ReturnType::Success,
    }
}

fn no_input(_: &mut Vec<u8>) -> Result<(), EncodeError> {
    Ok(())
}

fn encoder<I: Encode>(input: &I) -> impl FnOnce(&mut Vec<u8>) -> Result<(), EncodeError> + '_ {
    move |payload: &mut Vec<u8>| {
        bincode::encode_into_std_write(input, payload, payload_config()).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::mpsc, time::Duration};

    use crate::command::CommandFlags;

    use super::*;

    static QUERY: CommandInfo = CommandInfo::new(0, CommandFlags::NONE);

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            check_interval: Duration::ZERO,
            max_outstanding_commands: 2,
            ..Default::default()
        }
    }

    /// A client whose server accepts but never answers.
    fn silent_client() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (Client::from_stream(stream, config()).unwrap(), peer)
    }

    #[test]
    fn disposed_client_refuses_every_convention() {
        let (client, _peer) = silent_client();
        client.dispose();

        assert_eq!(client.wait_call(&QUERY), ReturnType::ClientDisposed);
        assert_eq!(
            client.wait_get::<u32>(&QUERY).kind,
            ReturnType::ClientDisposed
        );
        assert_eq!(
            client.call(&QUERY, |_| panic!("callback of a refused call")),
            ReturnType::ClientDisposed
        );
        assert_eq!(client.call_only(&QUERY), ReturnType::ClientDisposed);
        assert_eq!(client.notify_only(&QUERY, &7_u32), ReturnType::ClientDisposed);
        assert_eq!(client.connection().pending_calls(), 0);
    }

    #[test]
    fn exhausted_pool_is_a_client_exception() {
        let (client, _peer) = silent_client();
        let shared = client.connection().shared();
        let held: Vec<_> = (0..2).map(|_| shared.commands.acquire().unwrap()).collect();

        assert_eq!(client.wait_call(&QUERY), ReturnType::ClientException);
        assert_eq!(
            client.get(&QUERY, |_: ReturnValue<u32>| panic!("callback of a refused call")),
            ReturnType::ClientException
        );
        assert_eq!(client.connection().pending_calls(), 0);

        for command in held {
            shared.commands.release(command);
        }
        assert_eq!(client.call_only(&QUERY), ReturnType::Success);
    }

    #[test]
    fn dispose_resolves_blocked_and_async_callers() {
        let (client, _peer) = silent_client();
        let client = Arc::new(client);

        let (tx, rx) = mpsc::channel();
        assert_eq!(
            client.get(&QUERY, move |value: ReturnValue<u64>| tx.send(value.kind).unwrap()),
            ReturnType::Success
        );

        let blocked = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.wait_get_output::<_, u64>(&QUERY, &1_u64))
        };
        while client.connection().pending_calls() < 2 {
            std::thread::yield_now();
        }

        client.dispose();
        assert_eq!(blocked.join().unwrap().kind, ReturnType::ClientDisposed);
        assert_eq!(rx.recv().unwrap(), ReturnType::ClientDisposed);
    }

    #[test]
    fn wait_slots_are_recycled() {
        let (client, _peer) = silent_client();
        client.dispose();

        // A refused call never hands its slot out, so it goes straight back.
        for _ in 0..3 {
            client.wait_call(&QUERY);
        }
        assert_eq!(client.connection().shared().waiters.len(), 1);
    }

    fn queued_call(shared: &Shared, tx: mpsc::Sender<ReturnType>) -> (Box<Command>, u32) {
        let completion = Completion::Callback(Box::new(move |raw: RawReturn| {
            tx.send(raw.kind).unwrap();
        }));
        let index = shared.pending.register(completion).unwrap();
        let mut command = shared.commands.acquire().unwrap();
        command.set_request(CommandKind::Call, QUERY, index, false);
        (command, index)
    }

    #[test]
    fn call_refused_by_closed_queue_keeps_its_callback() {
        let shared = Shared::new(Arc::new(config()));
        let (tx, rx) = mpsc::channel();
        let (command, index) = queued_call(&shared, tx);
        drop(shared.queue.close());

        assert_eq!(enqueue(&shared, command, index), ReturnType::ClientDisposed);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.pending.len(), 0);
        assert_eq!(shared.commands.live(), 0);
    }

    #[test]
    fn call_that_loses_the_race_with_dispose_reports_success() {
        let shared = Shared::new(Arc::new(config()));
        let (tx, rx) = mpsc::channel();
        let (command, index) = queued_call(&shared, tx);
        shared.dispose();

        // The callback already carries the outcome, so it must not be reported twice.
        assert_eq!(rx.try_recv(), Ok(ReturnType::ClientDisposed));
        assert_eq!(enqueue(&shared, command, index), ReturnType::Success);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.commands.live(), 0);
    }
}
