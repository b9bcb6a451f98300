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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// broker collaborator errors
    #[error("broker error: {0}")]
    BrokerError(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// consumption errors raised by user logic
    #[error("consume error: {0}")]
    ConsumeError(String),

    #[error("consumer panicked: {0}")]
    ConsumerPanicked(String),
}

impl AppError {
    /// Shorthand for user logic reporting a processing failure.
    pub fn consume(reason: impl Into<String>) -> Self {
        AppError::ConsumeError(reason.into())
    }

    /// Recoverable errors are retried through redelivery. Everything else halts
    /// the partition that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::ConsumeError(_)
                | AppError::ConsumerPanicked(_)
                | AppError::TransactionAborted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(AppError::consume("boom"), true)]
    #[case(AppError::ConsumerPanicked("boom".to_string()), true)]
    #[case(AppError::TransactionAborted("fenced".to_string()), true)]
    #[case(AppError::BrokerError("unknown partition".to_string()), false)]
    #[case(AppError::InvalidValue("concurrency: 0".to_string()), false)]
    #[case(AppError::IllegalStateError("double begin".to_string()), false)]
    fn test_error_classification(#[case] error: AppError, #[case] recoverable: bool) {
        assert_eq!(error.is_recoverable(), recoverable);
        assert_eq!(error.is_fatal(), !recoverable);
    }
}
