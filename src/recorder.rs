use crate::errors::{IngressError, Result};
use crate::fuse::Fuse;
use crate::ingress::{IngressInfo, Status};
use crate::pipeline::{InputSource, Pipeline, PipelineFactory, SessionParams, StateReporter};
use crate::registry::StreamSource;
use async_trait::async_trait;
use chrono::prelude::*;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Builds pipelines that record an RTMP session's FLV stream to disk.
pub struct RecorderFactory {
    data_path: PathBuf,
}

impl RecorderFactory {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }
}

#[async_trait]
impl PipelineFactory for RecorderFactory {
    async fn build(&self, params: SessionParams) -> Result<Arc<dyn Pipeline>> {
        let info = params.info;
        let source = match params.source {
            InputSource::Rtmp(source) => source,
            InputSource::Whip { .. } => {
                return Err(IngressError::UnsupportedInput {
                    id: info.ingress_id,
                    kind: info.input_type.to_string(),
                })
            }
        };

        let stream_path = self.data_path.join(&info.ingress_id);
        super::prepare_stream_directory(&stream_path)?;
        let local: DateTime<Local> = Local::now();
        let flv_path = stream_path.join(format!("{}.flv", local.timestamp()));
        let file = File::create(&flv_path).await?;
        log::info!("Recording ingress {} to {}", info.ingress_id, flv_path.display());

        Ok(Arc::new(Recorder {
            ingress_id: info.ingress_id,
            path: flv_path,
            io: Mutex::new(Some((source, BufWriter::new(file)))),
            eos: Fuse::new(),
            reporter: params.reporter,
        }))
    }
}

struct Recorder {
    ingress_id: String,
    path: PathBuf,
    io: Mutex<Option<(StreamSource, BufWriter<File>)>>,
    eos: Fuse,
    reporter: StateReporter,
}

impl Recorder {
    async fn record(
        &self,
        source: &mut StreamSource,
        file: &mut BufWriter<File>,
    ) -> std::io::Result<u64> {
        let mut written = 0u64;
        let mut eos_seen = false;
        loop {
            let chunk = tokio::select! {
                chunk = source.recv() => chunk,
                _ = self.eos.wait(), if !eos_seen => {
                    eos_seen = true;
                    // drain what the publisher already sent
                    source.close();
                    continue;
                }
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            if written == 0 {
                self.reporter
                    .set_status(Status::EndpointPublishing, None)
                    .await;
            }
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Pipeline for Recorder {
    async fn run(&self) -> IngressInfo {
        let taken = self.io.lock().take();
        let Some((mut source, mut file)) = taken else {
            log::warn!("Recorder for ingress {} run twice", self.ingress_id);
            return self.reporter.info().await;
        };

        let res = self.record(&mut source, &mut file).await;
        // releases the publisher if it is still connected
        drop(source);

        let mut info = self.reporter.info().await;
        match res {
            Ok(written) => {
                log::info!(
                    "Recorded {} bytes of ingress {} to {}",
                    written,
                    self.ingress_id,
                    self.path.display()
                );
                info.set_status(Status::EndpointInactive, None);
            }
            Err(e) => {
                log::error!("Recording ingress {} failed: {}", self.ingress_id, e);
                info.set_status(Status::EndpointError, Some(e.to_string()));
            }
        }
        info
    }

    fn send_eos(&self) {
        self.eos.break_fuse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::MemoryInfo;
    use crate::ingress::InputType;
    use crate::registry::StreamSink;
    use bytes::Bytes;

    fn params(source: InputSource, info_service: Arc<MemoryInfo>) -> SessionParams {
        let info = IngressInfo::new("IN_rec", "key", InputType::Rtmp, "room");
        SessionParams {
            reporter: StateReporter::new(info_service, info.clone()),
            info,
            source,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xingress-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_whip_input_is_rejected_at_build() {
        let factory = RecorderFactory::new(temp_dir("whip"));
        let source = InputSource::Whip {
            resource_id: "RES_1".to_string(),
        };
        let res = factory.build(params(source, Arc::new(MemoryInfo::new()))).await;
        assert!(matches!(res, Err(IngressError::UnsupportedInput { .. })));
    }

    #[tokio::test]
    async fn test_records_until_publisher_leaves() {
        let dir = temp_dir("eof");
        let info_service = Arc::new(MemoryInfo::new());
        let (sink, source) = StreamSink::pair("key", 8);
        let pipeline = RecorderFactory::new(&dir)
            .build(params(InputSource::Rtmp(source), info_service.clone()))
            .await
            .unwrap();

        sink.write(Bytes::from_static(b"FLV")).await.unwrap();
        sink.write(Bytes::from_static(b"tag")).await.unwrap();
        sink.close();

        let info = pipeline.run().await;
        assert_eq!(info.state.status, Status::EndpointInactive);
        assert_eq!(
            info_service.last_state("IN_rec").unwrap().status,
            Status::EndpointPublishing
        );

        let mut entries = std::fs::read_dir(dir.join("IN_rec")).unwrap();
        let path = entries.next().unwrap().unwrap().path();
        assert_eq!(std::fs::read(path).unwrap(), b"FLVtag");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_eos_closes_the_sink() {
        let dir = temp_dir("eos");
        let (sink, source) = StreamSink::pair("key", 8);
        let pipeline = RecorderFactory::new(&dir)
            .build(params(InputSource::Rtmp(source), Arc::new(MemoryInfo::new())))
            .await
            .unwrap();

        let runner = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run().await })
        };
        pipeline.send_eos();
        let info = runner.await.unwrap();
        assert_eq!(info.state.status, Status::EndpointInactive);
        assert!(sink.is_closed());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
