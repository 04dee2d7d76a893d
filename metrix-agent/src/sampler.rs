use metrix_proto::{Metric, MetricValue};

/// Produces the metrics of one sample tick.
pub trait Sample: Send + 'static {
    fn sample(&mut self) -> Vec<Metric>;
}

/// Host values read once per tick, every table entry reads from this.
#[derive(Debug, Clone, Default)]
pub struct HostReading {
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub available_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub global_cpu: f32,
    pub cpu_usage: Vec<f32>,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub uptime: u64,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

pub struct Source {
    pub name: &'static str,
    pub read: fn(&HostReading) -> Option<MetricValue>,
}

fn gauge(v: impl Into<f64>) -> Option<MetricValue> {
    Some(MetricValue::Gauge(v.into()))
}

/// Every fixed metric the agent reports. Per-core utilisation and
/// `RandomValue` are appended separately.
pub const SOURCES: &[Source] = &[
    Source {
        name: "TotalMemory",
        read: |r| gauge(r.total_memory as f64),
    },
    Source {
        name: "UsedMemory",
        read: |r| gauge(r.used_memory as f64),
    },
    Source {
        name: "FreeMemory",
        read: |r| gauge(r.free_memory as f64),
    },
    Source {
        name: "AvailableMemory",
        read: |r| gauge(r.available_memory as f64),
    },
    Source {
        name: "TotalSwap",
        read: |r| gauge(r.total_swap as f64),
    },
    Source {
        name: "UsedSwap",
        read: |r| gauge(r.used_swap as f64),
    },
    Source {
        name: "GlobalCPUutilization",
        read: |r| gauge(r.global_cpu),
    },
    Source {
        name: "LoadAverage1",
        read: |r| gauge(r.load_one),
    },
    Source {
        name: "LoadAverage5",
        read: |r| gauge(r.load_five),
    },
    Source {
        name: "LoadAverage15",
        read: |r| gauge(r.load_fifteen),
    },
    Source {
        name: "Uptime",
        read: |r| gauge(r.uptime as f64),
    },
    Source {
        name: "RxBytes",
        read: |r| r.rx_bytes.map(|b| MetricValue::Gauge(b as f64)),
    },
    Source {
        name: "TxBytes",
        read: |r| r.tx_bytes.map(|b| MetricValue::Gauge(b as f64)),
    },
];

/// Turns one reading into the metric list.
pub fn metrics_from(reading: &HostReading) -> Vec<Metric> {
    let fixed = SOURCES.iter().filter_map(|source| {
        (source.read)(reading).map(|value| Metric {
            id: source.name.to_owned(),
            value,
        })
    });
    let cores = reading
        .cpu_usage
        .iter()
        .enumerate()
        .map(|(i, usage)| Metric::gauge(format!("CPUutilization{i}"), *usage as f64));

    fixed
        .chain(cores)
        .chain(std::iter::once(Metric::gauge("RandomValue", rand::random::<f64>())))
        .collect()
}

#[derive(Debug)]
pub struct HostSampler {
    system: sysinfo::System,
    net_interface: Option<netdev::Interface>,
}

impl HostSampler {
    pub fn try_new(if_name: Option<&str>) -> anyhow::Result<Self> {
        let mut system = sysinfo::System::new_all();
        system.refresh_cpu_all();
        let net_interface = match if_name {
            Some(name) => Some(
                netdev::get_interfaces()
                    .into_iter()
                    .find(|iface| iface.name == name)
                    .ok_or_else(|| anyhow::anyhow!("Network interface '{}' not found", name))?,
            ),
            // no default route is not fatal, the traffic gauges are just skipped
            None => netdev::get_default_interface().ok(),
        };
        Ok(Self {
            system,
            net_interface,
        })
    }

    fn read(&mut self) -> HostReading {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        let load = sysinfo::System::load_average();

        let (rx_bytes, tx_bytes) = match self.net_interface.as_mut() {
            Some(iface) => {
                let _ = iface.update_stats();
                let stats = iface.stats.as_ref();
                (stats.map(|s| s.rx_bytes), stats.map(|s| s.tx_bytes))
            }
            None => (None, None),
        };

        HostReading {
            total_memory: self.system.total_memory(),
            used_memory: self.system.used_memory(),
            free_memory: self.system.free_memory(),
            available_memory: self.system.available_memory(),
            total_swap: self.system.total_swap(),
            used_swap: self.system.used_swap(),
            global_cpu: self.system.global_cpu_usage(),
            cpu_usage: self.system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect(),
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            uptime: sysinfo::System::uptime(),
            rx_bytes,
            tx_bytes,
        }
    }
}

impl Sample for HostSampler {
    fn sample(&mut self) -> Vec<Metric> {
        let reading = self.read();
        metrics_from(&reading)
    }
}
