//! Docker transport: a thin specialization of the stdio transport that
//! rewrites the configured image/command/args into a `docker run` invocation
//! and otherwise reuses the stdio child-process machinery verbatim.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::transport::stdio::StdioTransport;
use crate::transport::{EventStream, MessageStream, Transport, DEFAULT_SEND_BUFFER_LIMIT};

pub struct DockerTransport {
    inner: StdioTransport,
}

impl DockerTransport {
    /// `image` is the container image to run; `args` are passed to the
    /// entrypoint inside the container. `env` is threaded through as
    /// `-e KEY=VALUE` flags rather than the host process environment, so
    /// the values reach the containerized process rather than `docker`
    /// itself.
    pub fn new(session_name: impl Into<String>, image: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self::with_send_buffer_limit(session_name, image, args, env, DEFAULT_SEND_BUFFER_LIMIT)
    }

    pub fn with_send_buffer_limit(
        session_name: impl Into<String>,
        image: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        send_buffer_limit: usize,
    ) -> Self {
        let session_name = session_name.into();
        let image = image.into();

        let mut docker_args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
        for (key, value) in &env {
            docker_args.push("-e".to_string());
            docker_args.push(format!("{key}={value}"));
        }
        docker_args.push(image);
        docker_args.extend(args);

        Self {
            inner: StdioTransport::with_send_buffer_limit(
                session_name,
                "docker",
                docker_args,
                HashMap::new(),
                send_buffer_limit,
            ),
        }
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn send(&self, message: Value) -> Result<()> {
        self.inner.send(message).await
    }

    fn receive_stream(&self) -> MessageStream {
        self.inner.receive_stream()
    }

    fn state_stream(&self) -> EventStream {
        self.inner.state_stream()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
