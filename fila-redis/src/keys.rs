use fila::job::JobId;
use redis::ToRedisArgs;

/// Prefix shared by every key the backend writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NameSpace(String);

impl NameSpace {
    pub fn new(prefix: impl ToString) -> Self {
        Self(prefix.to_string())
    }

    /// The set of queue names seen by this namespace.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.0)
    }

    pub fn queue<'a>(&'a self, queue: &'a str) -> QueueKeys<'a> {
        QueueKeys {
            namespace: &self.0,
            queue,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueKeys<'a> {
    namespace: &'a str,
    queue: &'a str,
}

impl<'a> QueueKeys<'a> {
    fn key(&self, kind: KeyType<'a>) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: self.namespace,
            queue: self.queue,
            kind,
        }
    }

    pub fn job(&self, id: &'a JobId) -> NameSpacedKey<'a> {
        self.key(KeyType::Job(id))
    }

    pub fn wait(&self) -> NameSpacedKey<'a> {
        self.key(KeyType::Wait)
    }

    pub fn active(&self) -> NameSpacedKey<'a> {
        self.key(KeyType::Active)
    }

    pub fn delayed(&self) -> NameSpacedKey<'a> {
        self.key(KeyType::Delayed)
    }

    pub fn completed(&self) -> NameSpacedKey<'a> {
        self.key(KeyType::Completed)
    }

    pub fn failed(&self) -> NameSpacedKey<'a> {
        self.key(KeyType::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NameSpacedKey<'a> {
    namespace: &'a str,
    queue: &'a str,
    kind: KeyType<'a>,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.queue)?;
        match self.kind {
            KeyType::Job(id) => write!(f, "{id}"),
            KeyType::Wait => write!(f, "wait"),
            KeyType::Active => write!(f, "active"),
            KeyType::Delayed => write!(f, "delayed"),
            KeyType::Completed => write!(f, "completed"),
            KeyType::Failed => write!(f, "failed"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

#[derive(Debug, Clone, Copy)]
enum KeyType<'a> {
    Job(&'a JobId),
    Wait,
    Active,
    Delayed,
    Completed,
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_queue() {
        let namespace = NameSpace::new("fila");
        let keys = namespace.queue("orcamento");
        let id = JobId::from("42");

        assert_eq!(keys.job(&id).to_string(), "fila:orcamento:42");
        assert_eq!(keys.wait().to_string(), "fila:orcamento:wait");
        assert_eq!(keys.active().to_string(), "fila:orcamento:active");
        assert_eq!(keys.delayed().to_string(), "fila:orcamento:delayed");
        assert_eq!(keys.completed().to_string(), "fila:orcamento:completed");
        assert_eq!(keys.failed().to_string(), "fila:orcamento:failed");
        assert_eq!(namespace.queues(), "fila:queues");
    }

    #[test]
    fn keys_write_a_single_argument() {
        let namespace = NameSpace::new("clinica:staging");
        let args = namespace.queue("orcamento").wait().to_redis_args();

        assert_eq!(args, vec![b"clinica:staging:orcamento:wait".to_vec()]);
    }
}
