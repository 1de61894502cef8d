use sysinfo::System;

/// 默认并行度推算（未显式配置 parallelism 时使用）
pub struct AdaptiveParallelism {
    system: System,
}

impl AdaptiveParallelism {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system }
    }

    /// 按负载与内存压力给出任务并行度
    pub fn suggest(&mut self) -> usize {
        self.system.refresh_memory();

        let load = System::load_average().one;
        let cpu_count = num_cpus::get().max(1);
        let total_mem = self.system.total_memory();
        let mem_pressure = if total_mem == 0 {
            0.0
        } else {
            1.0 - self.system.available_memory() as f64 / total_mem as f64
        };

        let parallelism = Self::decide(cpu_count, load, mem_pressure);
        tracing::info!(
            "Adaptive parallelism: {} (cpus: {}, load: {:.2}, mem_pressure: {:.2})",
            parallelism,
            cpu_count,
            load,
            mem_pressure
        );
        parallelism
    }

    fn decide(cpu_count: usize, load: f64, mem_pressure: f64) -> usize {
        let cpus = cpu_count as f64;
        if load > cpus * 0.8 || mem_pressure > 0.8 {
            // 系统繁忙：保守降级
            (cpu_count / 2).max(1)
        } else {
            // 正常负载：匹配核心数
            cpu_count
        }
    }
}

impl Default for AdaptiveParallelism {
    fn default() -> Self {
        Self::new()
    }
}
