//! C5: the registry — a map of registered services keyed by `fullName`,
//! run as a dedicated actor task (the message-passing alternative from §9,
//! the same shape as the teacher's `datastore::manager`).

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::service::Service;
use crate::state_machine::ServiceTaskHandle;

/// One registered service: the user's [`Service`] (current, possibly
/// TXT-updated) plus the handle to its running state-machine task (§3.3).
/// Entries are inserted only once a service reaches Established — a
/// still-probing service has no entry yet (§4.4, §4.5).
pub struct Entry {
    pub service: Service,
    pub handle: ServiceTaskHandle,
}

/// Requests understood by the registry actor. Each carries a `oneshot`
/// responder, mirroring the teacher's `datastore::Command::Get`.
pub enum Command {
    Insert {
        full_name: String,
        service: Service,
        handle: ServiceTaskHandle,
        resp: oneshot::Sender<Result<()>>,
    },
    Remove {
        full_name: String,
        resp: oneshot::Sender<Result<Entry>>,
    },
    Get {
        full_name: String,
        resp: oneshot::Sender<Option<Service>>,
    },
    UpdateTxt {
        full_name: String,
        txt: Vec<(String, String)>,
        resp: oneshot::Sender<Result<Service>>,
    },
    List {
        resp: oneshot::Sender<Vec<String>>,
    },
    ListServiceTypes {
        resp: oneshot::Sender<Vec<String>>,
    },
    /// Snapshot of every registered service, used by the query responder
    /// (C6) to find candidates for a question.
    Snapshot {
        resp: oneshot::Sender<Vec<Service>>,
    },
    Shutdown {
        resp: oneshot::Sender<Vec<Entry>>,
    },
}

/// A handle to the running registry actor. Cloned freely; every clone
/// shares the same backing task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub fn new() -> (RegistryHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(256);
        (RegistryHandle { tx }, rx)
    }

    pub async fn insert(
        &self,
        full_name: String,
        service: Service,
        handle: ServiceTaskHandle,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Insert {
                full_name,
                service,
                handle,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn remove(&self, full_name: String) -> Result<Entry> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Remove { full_name, resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn get(&self, full_name: String) -> Option<Service> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Get { full_name, resp }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn update_txt(
        &self,
        full_name: String,
        txt: Vec<(String, String)>,
    ) -> Result<Service> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateTxt {
                full_name,
                txt,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn list(&self) -> Vec<String> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::List { resp }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn list_service_types(&self) -> Vec<String> {
        let (resp, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::ListServiceTypes { resp })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// A stable snapshot of every registered service (§4.5: "list/snapshot
    /// operations must return a stable copy that does not tear under
    /// concurrent writers" — guaranteed here since the snapshot is built
    /// entirely inside the actor's single-threaded command loop).
    pub async fn snapshot(&self) -> Vec<Service> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { resp }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) -> Vec<Entry> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { resp }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Runs the registry actor loop until every [`RegistryHandle`] is dropped
/// or a [`Command::Shutdown`] is received. Owns the `HashMap` outright —
/// no lock needed since only this task ever touches it (§5, §9).
pub async fn manager(mut rx: mpsc::Receiver<Command>) {
    let mut entries: HashMap<String, Entry> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Insert {
                full_name,
                service,
                handle,
                resp,
            } => {
                let result = if entries.contains_key(&full_name) {
                    Err(Error::Registry(format!(
                        "a service named {full_name:?} is already registered"
                    )))
                } else {
                    entries.insert(full_name, Entry { service, handle });
                    Ok(())
                };
                let _ = resp.send(result);
            }
            Command::Remove { full_name, resp } => {
                let result = entries
                    .remove(&full_name)
                    .ok_or_else(|| Error::Registry(format!("no such service {full_name:?}")));
                let _ = resp.send(result);
            }
            Command::Get { full_name, resp } => {
                let _ = resp.send(entries.get(&full_name).map(|e| e.service.clone()));
            }
            Command::UpdateTxt {
                full_name,
                txt,
                resp,
            } => {
                let result = match entries.get_mut(&full_name) {
                    Some(entry) => {
                        entry.service.txt = txt;
                        Ok(entry.service.clone())
                    }
                    None => Err(Error::Registry(format!("no such service {full_name:?}"))),
                };
                let _ = resp.send(result);
            }
            Command::List { resp } => {
                let names: Vec<String> = entries.keys().cloned().collect();
                let _ = resp.send(names);
            }
            Command::ListServiceTypes { resp } => {
                let types: HashSet<String> = entries
                    .values()
                    .map(|e| e.service.service_type.clone())
                    .collect();
                let _ = resp.send(types.into_iter().collect());
            }
            Command::Snapshot { resp } => {
                let snapshot: Vec<Service> = entries.values().map(|e| e.service.clone()).collect();
                let _ = resp.send(snapshot);
            }
            Command::Shutdown { resp } => {
                let all: Vec<Entry> = entries.drain().map(|(_, v)| v).collect();
                let _ = resp.send(all);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use tokio_util::sync::CancellationToken;

    fn sample_service(name: &str) -> Service {
        Service::new(name, "_http._tcp.local", Some("dev.local".into()), 8080, vec![]).unwrap()
    }

    fn dummy_handle() -> ServiceTaskHandle {
        let (control, _rx) = mpsc::channel(1);
        ServiceTaskHandle {
            control,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let (handle, rx) = RegistryHandle::new();
        tokio::spawn(manager(rx));

        let svc = sample_service("MyPrinter");
        handle
            .insert(svc.full_name(), svc.clone(), dummy_handle())
            .await
            .unwrap();
        let err = handle
            .insert(svc.full_name(), svc.clone(), dummy_handle())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn list_and_list_service_types_are_populated() {
        let (handle, rx) = RegistryHandle::new();
        tokio::spawn(manager(rx));

        let a = sample_service("A");
        let b = sample_service("B");
        handle.insert(a.full_name(), a.clone(), dummy_handle()).await.unwrap();
        handle.insert(b.full_name(), b.clone(), dummy_handle()).await.unwrap();

        let names = handle.list().await;
        assert_eq!(names.len(), 2);
        let types = handle.list_service_types().await;
        assert_eq!(types, vec!["_http._tcp.local".to_string()]);
    }

    #[tokio::test]
    async fn update_txt_is_idempotent_in_effect() {
        let (handle, rx) = RegistryHandle::new();
        tokio::spawn(manager(rx));

        let svc = sample_service("MyPrinter");
        handle.insert(svc.full_name(), svc.clone(), dummy_handle()).await.unwrap();

        let txt = vec![("a".to_string(), "1".to_string())];
        let first = handle.update_txt(svc.full_name(), txt.clone()).await.unwrap();
        let second = handle.update_txt(svc.full_name(), txt.clone()).await.unwrap();
        assert_eq!(first.txt, second.txt);
    }

    #[tokio::test]
    async fn snapshot_reflects_current_entries() {
        let (handle, rx) = RegistryHandle::new();
        tokio::spawn(manager(rx));

        let svc = sample_service("MyPrinter");
        handle.insert(svc.full_name(), svc.clone(), dummy_handle()).await.unwrap();
        assert_eq!(handle.snapshot().await, vec![svc.clone()]);

        handle.remove(svc.full_name()).await.unwrap();
        assert!(handle.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn remove_then_remove_again_errors() {
        let (handle, rx) = RegistryHandle::new();
        tokio::spawn(manager(rx));

        let svc = sample_service("MyPrinter");
        handle.insert(svc.full_name(), svc.clone(), dummy_handle()).await.unwrap();
        assert!(handle.remove(svc.full_name()).await.is_ok());
        assert!(handle.remove(svc.full_name()).await.is_err());
    }
}
