use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use libsessiond::{SessionsClient, SocketChannel};
use sessiond_protocol::{Descriptor, DescriptorApiLevel};

/// One CLI invocation: a connected client plus output preferences.
pub struct Context {
    client: SessionsClient<SocketChannel>,
    json: bool,
}

impl Context {
    pub async fn connect(socket: &Path, caller: String, json: bool) -> Result<Self> {
        let channel = SocketChannel::connect(socket).await?;
        Ok(Self {
            client: SessionsClient::new(channel).with_caller(caller),
            json,
        })
    }

    pub async fn handshake(&self) -> Result<()> {
        self.client.handshake().await?;
        if self.json {
            println!("{{}}");
        } else {
            println!("sessions service is reachable");
        }
        Ok(())
    }

    pub async fn enumerate(&self, paths: Vec<String>) -> Result<()> {
        let descriptors = self
            .client
            .enumerate_done(paths.into_iter().map(DescriptorApiLevel::new).collect())
            .await?;
        self.print_descriptors(&descriptors)
    }

    pub async fn list(&self) -> Result<()> {
        let descriptors = self.client.get_sessions().await?;
        self.print_descriptors(&descriptors)
    }

    pub async fn acquire(
        &self,
        path: String,
        previous: Option<String>,
        owner: Option<String>,
    ) -> Result<()> {
        let acquired = self
            .client
            .acquire(path, previous, owner.as_deref())
            .await?;
        if self.json {
            print_json(&acquired)
        } else {
            println!("{}", acquired.session);
            Ok(())
        }
    }

    pub async fn release(&self, session: String) -> Result<()> {
        let descriptors = self.client.release(session).await?;
        self.print_descriptors(&descriptors)
    }

    pub async fn path(&self, session: String) -> Result<()> {
        let path = self.client.get_path_by_session(session).await?;
        if self.json {
            print_json(&serde_json::json!({ "path": path }))
        } else {
            println!("{path}");
            Ok(())
        }
    }

    /// Print events until the service hangs up or the user interrupts.
    pub async fn watch(&self) -> Result<()> {
        let mut events = self.client.subscribe();
        // Subscription is per connection; a request makes sure it is live.
        self.client.handshake().await?;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => print_json(&event)?,
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("warning: skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.client.channel().closed() => {
                    while let Ok(event) = events.try_recv() {
                        print_json(&event)?;
                    }
                    eprintln!("sessions service closed the connection");
                    break;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    pub async fn dispose(&self) -> Result<()> {
        self.client.dispose().await?;
        if self.json {
            println!("{{}}");
        } else {
            println!("all sessions disposed");
        }
        Ok(())
    }

    fn print_descriptors(&self, descriptors: &[Descriptor]) -> Result<()> {
        if self.json {
            return print_json(&descriptors);
        }
        if descriptors.is_empty() {
            println!("no devices");
            return Ok(());
        }
        println!("{:<6} {:<38} OWNER", "PATH", "SESSION");
        for descriptor in descriptors {
            println!(
                "{:<6} {:<38} {}",
                descriptor.path,
                descriptor.session.as_deref().unwrap_or("-"),
                descriptor.session_owner.as_deref().unwrap_or("-"),
            );
        }
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
