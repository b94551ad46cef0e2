mod image_caption;

use crate::{
    loader::{CreateModelFuture, ModelLoader},
    HandlerPayload,
};
use futures::Future;
pub use image_caption::*;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

/// Handle to a model living on its own thread. The model is created on the
/// first request and dropped after `offload_duration` without requests.
#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

async fn idle(offload_duration: Option<Duration>) {
    match offload_duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => futures::future::pending().await,
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    /// With `offload_duration` set to `None` the model stays loaded until
    /// every handle is dropped.
    pub fn new<T, TFut, TFn>(
        model_id: impl Into<String>,
        create_model: TFn,
        offload_duration: Option<Duration>,
    ) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + Send + 'static,
        TFut: Future<Output = anyhow::Result<T>> + Send + 'static,
        TFn: Fn() -> TFut + Send + 'static,
    {
        let model_id = model_id.into();
        let loader = ModelLoader::new(move || -> CreateModelFuture<T> { Box::pin(create_model()) });
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread_model_id = model_id.clone();
        std::thread::spawn(move || {
            let local = tokio::task::LocalSet::new();

            local.spawn_local(async move {
                loop {
                    tokio::select! {
                        _ = idle(offload_duration) => {
                            if loader.is_loaded().await {
                                tracing::debug!("No message received for {:?}, offload model {}", offload_duration, thread_model_id);
                                if let Err(e) = loader.offload().await {
                                    tracing::error!("failed to offload model: {}", e);
                                }
                            }
                        }
                        payload = rx.recv() => {
                            match payload {
                                Some((items, result_tx)) => {
                                    // If channel closed,
                                    // we have no way to response, just ignore task.
                                    if result_tx.is_closed() {
                                        continue;
                                    }

                                    if let Err(e) = loader.load().await {
                                        tracing::error!("failed to load model {}: {}", thread_model_id, e);
                                        if result_tx.send(Err(anyhow::anyhow!("failed to load model: {}", e))).is_err() {
                                            tracing::error!("failed to send results");
                                        }
                                        continue;
                                    }

                                    let mut model = loader.model.lock().await;
                                    let results = match model.as_mut() {
                                        Some(model) => model.process(items).await,
                                        None => Err(anyhow::anyhow!("no valid model")),
                                    };

                                    if result_tx.send(results).is_err() {
                                        tracing::error!("failed to send results");
                                    }
                                }
                                _ => {
                                    // this means all tx has been dropped
                                    if loader.is_loaded().await {
                                        tracing::debug!("all tx dropped, offload model and end loop");
                                        if let Err(e) = loader.offload().await {
                                            tracing::error!("failed to offload model: {}", e);
                                        }
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            rt.block_on(local);
        });

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        match self.tx.send((items, result_tx)).await {
            Ok(_) => {
                tracing::debug!("items sent to model");
            }
            Err(e) => {
                anyhow::bail!("failed to send items: {:?}", e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}
