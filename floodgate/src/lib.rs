/*!
# Floodgate

A consumer-producer task runtime for datastream replication pipelines: each
*datastream* names a source and a destination, and a task continuously polls
the source, translates records into envelopes and forwards them to the
destination with delivery tracking, backpressure via auto-pause, and safe
checkpointing.

A mirror datastream across two Kafka clusters looks like this:

```no_run
use std::sync::Arc;

use floodgate::config::ConnectorConfig;
use floodgate::datastream::Datastream;
use floodgate::producer::kafka::KafkaProducerHandle;
use floodgate::source::kafka::KafkaSourceAdapter;
use floodgate::supervisor::TaskSupervisor;
use floodgate::task::readiness::NoOpTopicReadiness;
use floodgate::task::translate::MirrorTranslator;
use floodgate::task::{ConnectorTask, TaskError};

let config = ConnectorConfig::default();
let task_config = config.task.clone();

let supervisor = Arc::new(TaskSupervisor::new(
    "kafka-mirror",
    config,
    Box::new(move |datastream: &Datastream| -> Result<ConnectorTask, TaskError> {
        let adapter = KafkaSourceAdapter::from_datastream(datastream, &task_config)
            .map_err(|err| TaskError::Subscribe(floodgate::source::SourceError::transient(err.to_string())))?;
        let producer = KafkaProducerHandle::from_datastream(datastream)
            .map_err(|err| TaskError::Producer(floodgate::producer::SendError::Transient {
                destination: datastream.destination().to_owned(),
                message: err.to_string(),
            }))?;
        let translator = MirrorTranslator::from_datastream(datastream)?;

        ConnectorTask::new(
            datastream.clone(),
            task_config.clone(),
            Box::new(adapter),
            Arc::new(producer),
            Box::new(translator),
            Arc::new(NoOpTopicReadiness),
        )
    }),
));

supervisor.start();
supervisor.on_assignment_change(vec![Datastream::new(
    "orders-mirror",
    "kafka-mirror",
    "kafka://source:9092/^orders.*$",
    "kafka://dest:9092/%s",
)]);
```
 */

/*
 * Copyright 2024 Thaddeus Treloar
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

pub mod checkpoint;
pub mod config;
pub mod datastream;
pub mod diag;
pub mod init;
pub mod message;
pub mod partition;
pub mod pause;
pub mod producer;
pub mod source;
pub mod supervisor;
pub mod task;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testutil;
