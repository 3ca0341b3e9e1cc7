// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Composite key of one partition, displayed and stored as `topic-partition`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keeps_dashed_topic() {
        assert_eq!(TopicPartition::new("order-events", 12).to_string(), "order-events-12");
    }

    #[test]
    fn orders_by_topic_then_partition() {
        let mut keys = vec![
            TopicPartition::new("refunds", 0),
            TopicPartition::new("orders", 11),
            TopicPartition::new("orders", 2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                TopicPartition::new("orders", 2),
                TopicPartition::new("orders", 11),
                TopicPartition::new("refunds", 0),
            ]
        );
    }
}
